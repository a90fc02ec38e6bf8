pub mod formatters;

pub use formatters::{formatter_for, ConsoleFormatter, CsvFormatter, HexFormatter, JsonFormatter, ResultFormatter};
