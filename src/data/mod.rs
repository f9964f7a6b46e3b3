pub mod table;
pub mod value;

pub use table::{Table, TableError};
pub use value::{parse_datetime, DataType, GenericDataType, Value};
