use arrow_schema::{DataType, Field, Schema};
use std::sync::Arc;

/// Columns a search filter may constrain.
pub const FILTERABLE_COLUMNS: &[&str] = &["source", "chunk_id"];

pub fn build_index_schema(dim: i32) -> Arc<Schema> {
	Arc::new(Schema::new(vec![
		Field::new("row_id", DataType::Int64, false),
		Field::new("chunk_id", DataType::Utf8, false),
		Field::new("source", DataType::Utf8, false),
		Field::new("vector", DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim), true),
	]))
}

/// Vector width declared by an index schema, if it has a vector column.
pub fn vector_dimension(schema: &Schema) -> Option<usize> {
	match schema.field_with_name("vector").ok()?.data_type() {
		DataType::FixedSizeList(_, n) => usize::try_from(*n).ok(),
		_ => None,
	}
}
