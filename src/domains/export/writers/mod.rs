//! Renderers turning a replayed staging artifact into a final file.

pub mod csv_writer;
pub mod xlsx_writer;

pub use csv_writer::render_csv;
pub use xlsx_writer::render_xlsx;
