//! Reader/Writer traits and format dispatch
//!
//! Graph payloads ([`GraphData`]) are read from and written to files through
//! the [`GraphReader`] and [`GraphWriter`] traits. A [`FormatRegistry`] picks
//! the implementation from the file extension or a format id.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::model::GraphData;

/// Errors that can occur during reading or writing
#[derive(Error, Debug)]
pub enum IoError {
    /// The file format is not supported
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The file extension could not be determined
    #[error("could not determine file format from path: {0}")]
    UnknownExtension(String),

    /// An I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A parsing error occurred
    #[error("parse error: {0}")]
    Parse(String),

    /// A serialization error occurred
    #[error("write error: {0}")]
    Write(String),
}

/// Result type for reader/writer operations
pub type IoResult<T> = Result<T, IoError>;

/// A reader parses a graph payload file
pub trait GraphReader {
    fn read(&self, input: &Path) -> IoResult<GraphData>;

    /// File extensions this reader can handle (e.g., ["yaml", "yml"])
    fn supported_extensions(&self) -> &[&str];

    /// Check if this reader can handle the given file extension
    fn supports_extension(&self, ext: &str) -> bool {
        self.supported_extensions()
            .iter()
            .any(|e| e.eq_ignore_ascii_case(ext))
    }
}

/// A writer outputs a graph payload in one format
pub trait GraphWriter {
    fn write(&self, data: &GraphData, output: &Path) -> IoResult<()>;

    /// Identifier for this output format (e.g., "json")
    fn format_id(&self) -> &str;
}

/// Reads `.json` payloads
#[derive(Debug, Default)]
pub struct JsonGraphReader;

impl GraphReader for JsonGraphReader {
    fn read(&self, input: &Path) -> IoResult<GraphData> {
        let content = fs::read_to_string(input)?;
        serde_json::from_str(&content).map_err(|e| IoError::Parse(e.to_string()))
    }

    fn supported_extensions(&self) -> &[&str] {
        &["json"]
    }
}

/// Reads `.yaml` / `.yml` payloads
#[derive(Debug, Default)]
pub struct YamlGraphReader;

impl GraphReader for YamlGraphReader {
    fn read(&self, input: &Path) -> IoResult<GraphData> {
        let content = fs::read_to_string(input)?;
        serde_yaml::from_str(&content).map_err(|e| IoError::Parse(e.to_string()))
    }

    fn supported_extensions(&self) -> &[&str] {
        &["yaml", "yml"]
    }
}

/// Writes pretty-printed JSON payloads
#[derive(Debug, Default)]
pub struct JsonGraphWriter;

impl GraphWriter for JsonGraphWriter {
    fn write(&self, data: &GraphData, output: &Path) -> IoResult<()> {
        let json = serde_json::to_string_pretty(data).map_err(|e| IoError::Write(e.to_string()))?;
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(output, json)?;
        Ok(())
    }

    fn format_id(&self) -> &str {
        "json"
    }
}

/// Registry of available readers and writers
#[derive(Default)]
pub struct FormatRegistry {
    readers: Vec<Box<dyn GraphReader>>,
    writers: Vec<Box<dyn GraphWriter>>,
}

impl FormatRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the JSON and YAML readers and the JSON writer
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_reader(Box::new(JsonGraphReader));
        registry.register_reader(Box::new(YamlGraphReader));
        registry.register_writer(Box::new(JsonGraphWriter));
        registry
    }

    pub fn register_reader(&mut self, reader: Box<dyn GraphReader>) {
        self.readers.push(reader);
    }

    pub fn register_writer(&mut self, writer: Box<dyn GraphWriter>) {
        self.writers.push(writer);
    }

    /// Find a reader for the given file extension
    pub fn reader_for_extension(&self, ext: &str) -> Option<&dyn GraphReader> {
        self.readers
            .iter()
            .find(|r| r.supports_extension(ext))
            .map(|r| r.as_ref())
    }

    /// Find a writer by format ID
    pub fn writer_for_format(&self, format_id: &str) -> Option<&dyn GraphWriter> {
        self.writers
            .iter()
            .find(|w| w.format_id().eq_ignore_ascii_case(format_id))
            .map(|w| w.as_ref())
    }

    pub fn extension_from_path(path: &Path) -> Option<&str> {
        path.extension().and_then(|e| e.to_str())
    }

    /// Find a reader for the given path based on its extension
    pub fn reader_for_path(&self, path: &Path) -> IoResult<&dyn GraphReader> {
        let ext = Self::extension_from_path(path)
            .ok_or_else(|| IoError::UnknownExtension(path.display().to_string()))?;

        self.reader_for_extension(ext)
            .ok_or_else(|| IoError::UnsupportedFormat(ext.to_string()))
    }

    /// Read a payload, choosing the reader from the extension
    pub fn read(&self, path: &Path) -> IoResult<GraphData> {
        self.reader_for_path(path)?.read(path)
    }

    /// Write a payload in the given format
    pub fn write(&self, data: &GraphData, format_id: &str, output: &Path) -> IoResult<()> {
        self.writer_for_format(format_id)
            .ok_or_else(|| IoError::UnsupportedFormat(format_id.to_string()))?
            .write(data, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeAttrs;
    use std::io::Write;
    use std::path::PathBuf;

    fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn reader_supports_extension_case_insensitive() {
        assert!(YamlGraphReader.supports_extension("yml"));
        assert!(YamlGraphReader.supports_extension("YAML"));
        assert!(!YamlGraphReader.supports_extension("json"));
    }

    #[test]
    fn registry_finds_reader_by_path() {
        let registry = FormatRegistry::with_defaults();

        assert!(registry.reader_for_path(&PathBuf::from("graph.json")).is_ok());
        assert!(registry.reader_for_path(&PathBuf::from("graph.yml")).is_ok());
        assert!(matches!(
            registry.reader_for_path(&PathBuf::from("graph.csv")),
            Err(IoError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            registry.reader_for_path(&PathBuf::from("graph")),
            Err(IoError::UnknownExtension(_))
        ));
    }

    #[test]
    fn registry_finds_writer_by_format() {
        let registry = FormatRegistry::with_defaults();
        assert!(registry.writer_for_format("JSON").is_some());
        assert!(registry.writer_for_format("yaml").is_none());
    }

    #[test]
    fn reads_yaml_payload() {
        let file = write_temp(
            ".yaml",
            "nodes:\n  - id: a\n    attrs:\n      type: note\n  - id: b\nedges:\n  - id: e\n    source: a\n    target: b\n",
        );
        let data = FormatRegistry::with_defaults().read(file.path()).unwrap();

        assert_eq!(data.nodes.len(), 2);
        assert_eq!(data.nodes[0].attrs.node_type.as_deref(), Some("note"));
        assert_eq!(data.edges[0].source, "a");
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let file = write_temp(".json", "{\"nodes\": [");
        assert!(matches!(
            FormatRegistry::with_defaults().read(file.path()),
            Err(IoError::Parse(_))
        ));
    }

    #[test]
    fn json_writer_output_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("graph.json");
        let data = GraphData::new()
            .with_node("a", NodeAttrs::at(1.0, 2.0))
            .with_node("b", NodeAttrs::default())
            .with_edge("e", "a", "b");

        let registry = FormatRegistry::with_defaults();
        registry.write(&data, "json", &path).unwrap();

        assert_eq!(registry.read(&path).unwrap(), data);
    }

    #[test]
    fn io_error_display() {
        let err = IoError::UnsupportedFormat("xyz".to_string());
        assert_eq!(err.to_string(), "unsupported format: xyz");

        let err = IoError::Parse("invalid syntax".to_string());
        assert_eq!(err.to_string(), "parse error: invalid syntax");
    }
}
