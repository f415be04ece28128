//! Apache Arrow IPC streaming bodies for `load`.

use std::sync::Arc;

use arrow::error::ArrowError;
use arrow::ipc::writer::StreamWriter;
use arrow::json::reader::{infer_json_schema_from_iterator, ReaderBuilder};
use serde_json::{Map, Value};

/// Convert a JSON `load` value array into an Arrow IPC stream.
///
/// Both value shapes are accepted: an array of objects, or an array of
/// arrays whose first element lists the column names.
pub fn json_values_to_ipc_stream(values: &str) -> Result<Vec<u8>, ArrowError> {
    let parsed: Value =
        serde_json::from_str(values).map_err(|e| ArrowError::JsonError(e.to_string()))?;
    let Value::Array(items) = parsed else {
        return Err(ArrowError::JsonError("load values must be an array".to_string()));
    };
    let rows = to_records(items)?;

    let schema = Arc::new(infer_json_schema_from_iterator(rows.iter().map(Ok))?);
    let mut decoder = ReaderBuilder::new(Arc::clone(&schema)).build_decoder()?;
    decoder.serialize(&rows)?;

    let mut buffer = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buffer, &schema)?;
        if let Some(batch) = decoder.flush()? {
            writer.write(&batch)?;
        }
        writer.finish()?;
    }
    Ok(buffer)
}

fn to_records(items: Vec<Value>) -> Result<Vec<Value>, ArrowError> {
    let mut items = items.into_iter();
    let Some(first) = items.next() else {
        return Ok(Vec::new());
    };
    let Value::Array(header) = first else {
        return Ok(std::iter::once(first).chain(items).collect());
    };
    let columns: Vec<String> = header
        .iter()
        .map(|name| name.as_str().map(str::to_string))
        .collect::<Option<_>>()
        .ok_or_else(|| ArrowError::JsonError("column names must be strings".to_string()))?;
    items
        .map(|row| match row {
            Value::Array(cells) => Ok(Value::Object(
                columns.iter().cloned().zip(cells).collect::<Map<String, Value>>(),
            )),
            _ => Err(ArrowError::JsonError("mixed row shapes".to_string())),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use arrow::ipc::reader::StreamReader;

    use super::*;

    fn read_back(bytes: Vec<u8>) -> (Vec<String>, usize) {
        let reader = StreamReader::try_new(std::io::Cursor::new(bytes), None).unwrap();
        let schema = reader.schema();
        let names = schema.fields().iter().map(|f| f.name().clone()).collect();
        let n_rows = reader.map(|batch| batch.unwrap().num_rows()).sum();
        (names, n_rows)
    }

    #[test]
    fn object_rows() {
        let bytes = json_values_to_ipc_stream(r#"[{"_key":"a","n":1},{"_key":"b","n":2}]"#).unwrap();
        let (mut names, n_rows) = read_back(bytes);
        names.sort();
        assert_eq!(names, vec!["_key", "n"]);
        assert_eq!(n_rows, 2);
    }

    #[test]
    fn header_rows() {
        let bytes = json_values_to_ipc_stream(r#"[["_key","n"],["a",1],["b",2],["c",3]]"#).unwrap();
        let (_, n_rows) = read_back(bytes);
        assert_eq!(n_rows, 3);
    }

    #[test]
    fn not_an_array() {
        assert!(json_values_to_ipc_stream(r#"{"_key":"a"}"#).is_err());
    }
}
