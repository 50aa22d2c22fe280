//! Segment file formats.
//!
//! A [`Codec`] turns the in-memory [`SegmentData`] of a flushed or merged
//! segment into files and back, and owns the per-generation live-docs and
//! doc-values update files. The writer never assumes anything about the
//! byte layout; it only needs the set of file names a call produced.
//!
//! [`DefaultCodec`] writes one file per concern, each framed by
//! [`StructWriter`] (magic, version, trailing CRC32):
//!
//! | extension | content                                   |
//! |-----------|-------------------------------------------|
//! | `.fnm`    | field infos                               |
//! | `.pst`    | postings, delta-coded doc IDs & positions |
//! | `.nrm`    | per-field norms (token counts)            |
//! | `.dv`     | numeric and binary doc values             |
//! | `.fdt`    | stored fields                             |
//! | `.liv`    | live-docs bitset, one file per generation |
//! | `.dvu`    | doc-values update columns, per generation |

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::document::field::FieldValue;
use crate::error::{Result, StrataError};
use crate::index::field_infos::FieldInfos;
use crate::index::live_docs::LiveDocs;
use crate::index::segment::{SegmentInfo, field_updates_file_name, live_docs_file_name};
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

/// One document's occurrences of a term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    /// Segment-local document ID.
    pub doc: u32,
    /// Token positions within the field, ascending.
    pub positions: Vec<u32>,
}

impl Posting {
    /// Create a posting.
    pub fn new(doc: u32, positions: Vec<u32>) -> Self {
        Posting { doc, positions }
    }

    /// Term frequency in the document.
    pub fn freq(&self) -> u32 {
        self.positions.len() as u32
    }
}

/// Term text to postings, ordered by text; postings ordered by doc.
pub type TermPostings = BTreeMap<String, Vec<Posting>>;

/// A stored field value of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredField {
    /// Field name.
    pub name: String,
    /// The stored value.
    pub value: FieldValue,
}

/// Doc-values columns, one slot per document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocValuesColumns {
    /// Numeric columns by field.
    pub numeric: BTreeMap<String, Vec<Option<i64>>>,
    /// Binary columns by field.
    pub binary: BTreeMap<String, Vec<Option<Vec<u8>>>>,
}

impl DocValuesColumns {
    /// Whether no column is present.
    pub fn is_empty(&self) -> bool {
        self.numeric.is_empty() && self.binary.is_empty()
    }

    /// Names of all fields with a column.
    pub fn fields(&self) -> Vec<String> {
        self.numeric
            .keys()
            .chain(self.binary.keys())
            .cloned()
            .collect()
    }
}

/// Everything a segment holds, in memory.
#[derive(Debug, Clone, Default)]
pub struct SegmentData {
    /// Number of documents.
    pub max_doc: u32,
    /// Field metadata.
    pub field_infos: FieldInfos,
    /// Field to term to postings.
    pub postings: BTreeMap<String, TermPostings>,
    /// Field to per-document token count.
    pub norms: BTreeMap<String, Vec<u32>>,
    /// Numeric doc values by field.
    pub numeric_doc_values: BTreeMap<String, Vec<Option<i64>>>,
    /// Binary doc values by field.
    pub binary_doc_values: BTreeMap<String, Vec<Option<Vec<u8>>>>,
    /// Stored fields, one entry per document.
    pub stored: Vec<Vec<StoredField>>,
}

impl SegmentData {
    /// Empty data for `max_doc` documents.
    pub fn new(max_doc: u32) -> Self {
        SegmentData {
            max_doc,
            stored: vec![Vec::new(); max_doc as usize],
            ..Default::default()
        }
    }
}

/// Reads and writes segment files.
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// Codec name recorded in [`SegmentInfo::codec`].
    fn name(&self) -> &'static str;

    /// Write a segment's files; returns the names written.
    fn write_segment(
        &self,
        storage: &dyn Storage,
        segment: &str,
        data: &SegmentData,
    ) -> Result<BTreeSet<String>>;

    /// Read a segment back into memory.
    fn open_segment(&self, storage: &dyn Storage, info: &SegmentInfo) -> Result<SegmentData>;

    /// Write live docs under a delete generation; returns the file name.
    fn write_live_docs(
        &self,
        storage: &dyn Storage,
        segment: &str,
        del_gen: i64,
        live_docs: &LiveDocs,
    ) -> Result<String>;

    /// Read live docs of a delete generation.
    fn read_live_docs(
        &self,
        storage: &dyn Storage,
        segment: &str,
        del_gen: i64,
        max_doc: u32,
    ) -> Result<LiveDocs>;

    /// Write doc-values update columns under a generation; returns the file name.
    fn write_field_updates(
        &self,
        storage: &dyn Storage,
        segment: &str,
        gen: i64,
        columns: &DocValuesColumns,
    ) -> Result<String>;

    /// Read a doc-values update file.
    fn read_field_updates(&self, storage: &dyn Storage, file: &str) -> Result<DocValuesColumns>;
}

const FIELD_INFOS_MAGIC: u32 = 0x5346_4E4D; // "SFNM"
const POSTINGS_MAGIC: u32 = 0x5350_5354; // "SPST"
const NORMS_MAGIC: u32 = 0x534E_524D; // "SNRM"
const DOC_VALUES_MAGIC: u32 = 0x5344_5653; // "SDVS"
const STORED_MAGIC: u32 = 0x5346_4454; // "SFDT"
const LIVE_DOCS_MAGIC: u32 = 0x534C_4956; // "SLIV"
const UPDATES_MAGIC: u32 = 0x5344_5655; // "SDVU"
const VERSION: u32 = 1;

const TYPE_TEXT: u8 = 0;
const TYPE_KEYWORD: u8 = 1;
const TYPE_NUMERIC: u8 = 2;
const TYPE_BINARY: u8 = 3;

/// The built-in codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCodec;

impl DefaultCodec {
    /// Create the default codec.
    pub fn new() -> Self {
        DefaultCodec
    }

    fn write_field_infos(&self, storage: &dyn Storage, file: &str, infos: &FieldInfos) -> Result<()> {
        let mut writer = StructWriter::new(storage.create_output(file)?);
        writer.write_header(FIELD_INFOS_MAGIC, VERSION)?;
        writer.write_serialized(infos)?;
        writer.close()
    }

    fn write_postings(
        &self,
        storage: &dyn Storage,
        file: &str,
        postings: &BTreeMap<String, TermPostings>,
    ) -> Result<()> {
        let mut writer = StructWriter::new(storage.create_output(file)?);
        writer.write_header(POSTINGS_MAGIC, VERSION)?;
        writer.write_varint(postings.len() as u64)?;

        for (field, terms) in postings {
            writer.write_string(field)?;
            writer.write_varint(terms.len() as u64)?;
            for (text, list) in terms {
                writer.write_string(text)?;
                let docs: Vec<u32> = list.iter().map(|p| p.doc).collect();
                writer.write_delta_compressed_u32s(&docs)?;
                for posting in list {
                    writer.write_delta_compressed_u32s(&posting.positions)?;
                }
            }
        }

        writer.close()
    }

    fn write_stored(&self, storage: &dyn Storage, file: &str, stored: &[Vec<StoredField>]) -> Result<()> {
        let mut writer = StructWriter::new(storage.create_output(file)?);
        writer.write_header(STORED_MAGIC, VERSION)?;
        writer.write_varint(stored.len() as u64)?;

        for fields in stored {
            writer.write_varint(fields.len() as u64)?;
            for field in fields {
                writer.write_string(&field.name)?;
                match &field.value {
                    FieldValue::Text(text) => {
                        writer.write_u8(TYPE_TEXT)?;
                        writer.write_string(text)?;
                    }
                    FieldValue::Keyword(text) => {
                        writer.write_u8(TYPE_KEYWORD)?;
                        writer.write_string(text)?;
                    }
                    FieldValue::Numeric(num) => {
                        writer.write_u8(TYPE_NUMERIC)?;
                        writer.write_u64(*num as u64)?;
                    }
                    FieldValue::Binary(bytes) => {
                        writer.write_u8(TYPE_BINARY)?;
                        writer.write_bytes(bytes)?;
                    }
                }
            }
        }

        writer.close()
    }

    fn read_stored(&self, storage: &dyn Storage, file: &str) -> Result<Vec<Vec<StoredField>>> {
        let mut reader = StructReader::new(storage.open_input(file)?)?;
        reader.check_header(STORED_MAGIC, VERSION)?;
        let num_docs = reader.read_varint()? as usize;
        let mut stored = Vec::with_capacity(num_docs);

        for _ in 0..num_docs {
            let num_fields = reader.read_varint()? as usize;
            let mut fields = Vec::with_capacity(num_fields);
            for _ in 0..num_fields {
                let name = reader.read_string()?;
                let value = match reader.read_u8()? {
                    TYPE_TEXT => FieldValue::Text(reader.read_string()?),
                    TYPE_KEYWORD => FieldValue::Keyword(reader.read_string()?),
                    TYPE_NUMERIC => FieldValue::Numeric(reader.read_u64()? as i64),
                    TYPE_BINARY => FieldValue::Binary(reader.read_bytes()?),
                    tag => {
                        return Err(StrataError::storage(format!(
                            "unknown stored field type {tag} in {file}"
                        )));
                    }
                };
                fields.push(StoredField { name, value });
            }
            stored.push(fields);
        }

        reader.finish()?;
        Ok(stored)
    }

    fn read_postings(&self, storage: &dyn Storage, file: &str) -> Result<BTreeMap<String, TermPostings>> {
        let mut reader = StructReader::new(storage.open_input(file)?)?;
        reader.check_header(POSTINGS_MAGIC, VERSION)?;
        let num_fields = reader.read_varint()?;
        let mut postings = BTreeMap::new();

        for _ in 0..num_fields {
            let field = reader.read_string()?;
            let num_terms = reader.read_varint()?;
            let mut terms = TermPostings::new();
            for _ in 0..num_terms {
                let text = reader.read_string()?;
                let docs = reader.read_delta_compressed_u32s()?;
                let mut list = Vec::with_capacity(docs.len());
                for doc in docs {
                    list.push(Posting::new(doc, reader.read_delta_compressed_u32s()?));
                }
                terms.insert(text, list);
            }
            postings.insert(field, terms);
        }

        reader.finish()?;
        Ok(postings)
    }
}

impl Codec for DefaultCodec {
    fn name(&self) -> &'static str {
        "default"
    }

    fn write_segment(
        &self,
        storage: &dyn Storage,
        segment: &str,
        data: &SegmentData,
    ) -> Result<BTreeSet<String>> {
        let mut files = BTreeSet::new();

        let file = format!("{segment}.fnm");
        self.write_field_infos(storage, &file, &data.field_infos)?;
        files.insert(file);

        let file = format!("{segment}.pst");
        self.write_postings(storage, &file, &data.postings)?;
        files.insert(file);

        let file = format!("{segment}.nrm");
        let mut writer = StructWriter::new(storage.create_output(&file)?);
        writer.write_header(NORMS_MAGIC, VERSION)?;
        writer.write_serialized(&data.norms)?;
        writer.close()?;
        files.insert(file);

        let file = format!("{segment}.dv");
        let mut writer = StructWriter::new(storage.create_output(&file)?);
        writer.write_header(DOC_VALUES_MAGIC, VERSION)?;
        writer.write_serialized(&data.numeric_doc_values)?;
        writer.write_serialized(&data.binary_doc_values)?;
        writer.close()?;
        files.insert(file);

        let file = format!("{segment}.fdt");
        self.write_stored(storage, &file, &data.stored)?;
        files.insert(file);

        Ok(files)
    }

    fn open_segment(&self, storage: &dyn Storage, info: &SegmentInfo) -> Result<SegmentData> {
        if info.codec != self.name() {
            return Err(StrataError::index(format!(
                "segment {} was written by codec \"{}\", not \"{}\"",
                info.name,
                info.codec,
                self.name()
            )));
        }
        let segment = &info.name;

        let mut reader = StructReader::new(storage.open_input(&format!("{segment}.fnm"))?)?;
        reader.check_header(FIELD_INFOS_MAGIC, VERSION)?;
        let field_infos: FieldInfos = reader.read_serialized()?;
        reader.finish()?;

        let postings = self.read_postings(storage, &format!("{segment}.pst"))?;

        let mut reader = StructReader::new(storage.open_input(&format!("{segment}.nrm"))?)?;
        reader.check_header(NORMS_MAGIC, VERSION)?;
        let norms = reader.read_serialized()?;
        reader.finish()?;

        let mut reader = StructReader::new(storage.open_input(&format!("{segment}.dv"))?)?;
        reader.check_header(DOC_VALUES_MAGIC, VERSION)?;
        let numeric_doc_values = reader.read_serialized()?;
        let binary_doc_values = reader.read_serialized()?;
        reader.finish()?;

        let stored = self.read_stored(storage, &format!("{segment}.fdt"))?;
        if stored.len() != info.max_doc as usize {
            return Err(StrataError::storage(format!(
                "segment {segment} stores {} documents, expected {}",
                stored.len(),
                info.max_doc
            )));
        }

        Ok(SegmentData {
            max_doc: info.max_doc,
            field_infos,
            postings,
            norms,
            numeric_doc_values,
            binary_doc_values,
            stored,
        })
    }

    fn write_live_docs(
        &self,
        storage: &dyn Storage,
        segment: &str,
        del_gen: i64,
        live_docs: &LiveDocs,
    ) -> Result<String> {
        let file = live_docs_file_name(segment, del_gen);
        let mut writer = StructWriter::new(storage.create_output(&file)?);
        writer.write_header(LIVE_DOCS_MAGIC, VERSION)?;
        writer.write_varint(live_docs.max_doc() as u64)?;
        writer.write_bytes(&live_docs.to_bytes())?;
        writer.close()?;
        Ok(file)
    }

    fn read_live_docs(
        &self,
        storage: &dyn Storage,
        segment: &str,
        del_gen: i64,
        max_doc: u32,
    ) -> Result<LiveDocs> {
        let file = live_docs_file_name(segment, del_gen);
        let mut reader = StructReader::new(storage.open_input(&file)?)?;
        reader.check_header(LIVE_DOCS_MAGIC, VERSION)?;
        let stored_max_doc = reader.read_varint()? as u32;
        if stored_max_doc != max_doc {
            return Err(StrataError::storage(format!(
                "{file} covers {stored_max_doc} documents, expected {max_doc}"
            )));
        }
        let bytes = reader.read_bytes()?;
        reader.finish()?;
        LiveDocs::from_bytes(&bytes, max_doc)
    }

    fn write_field_updates(
        &self,
        storage: &dyn Storage,
        segment: &str,
        gen: i64,
        columns: &DocValuesColumns,
    ) -> Result<String> {
        let file = field_updates_file_name(segment, gen);
        let mut writer = StructWriter::new(storage.create_output(&file)?);
        writer.write_header(UPDATES_MAGIC, VERSION)?;
        writer.write_serialized(columns)?;
        writer.close()?;
        Ok(file)
    }

    fn read_field_updates(&self, storage: &dyn Storage, file: &str) -> Result<DocValuesColumns> {
        let mut reader = StructReader::new(storage.open_input(file)?)?;
        reader.check_header(UPDATES_MAGIC, VERSION)?;
        let columns = reader.read_serialized()?;
        reader.finish()?;
        Ok(columns)
    }
}
