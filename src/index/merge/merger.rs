//! Combines segment readers into the data of one new segment.
//!
//! Deleted documents are dropped and the remaining ones renumbered densely,
//! segment after segment. The per-segment [`DocMap`]s let the writer carry
//! deletes and doc-values updates that arrived while the merge ran over to
//! the merged segment.

use std::collections::BTreeMap;

use log::{debug, info};

use crate::error::Result;
use crate::index::codec::{Posting, SegmentData};
use crate::index::field_infos::{FieldInfosBuilder, FieldNumbers};
use crate::index::merge::policy::OneMerge;
use crate::index::reader::SegmentReader;

/// Old-to-new document numbers of one merged segment.
#[derive(Debug, Clone, Default)]
pub struct DocMap {
    new_docs: Vec<Option<u32>>,
}

impl DocMap {
    fn build(reader: &SegmentReader, base: u32) -> Self {
        let mut next = base;
        let new_docs = (0..reader.max_doc())
            .map(|doc| {
                reader.is_live(doc).then(|| {
                    next += 1;
                    next - 1
                })
            })
            .collect();
        DocMap { new_docs }
    }

    /// New number of `doc`, or `None` if it was deleted.
    pub fn get(&self, doc: u32) -> Option<u32> {
        self.new_docs.get(doc as usize).copied().flatten()
    }

    /// Documents in the source segment.
    pub fn len(&self) -> usize {
        self.new_docs.len()
    }

    /// Whether the source segment was empty.
    pub fn is_empty(&self) -> bool {
        self.new_docs.is_empty()
    }

    /// Documents that survived the merge.
    pub fn num_live(&self) -> u32 {
        self.new_docs.iter().filter(|d| d.is_some()).count() as u32
    }
}

/// Output of a merge.
#[derive(Debug)]
pub struct MergedSegment {
    /// Data of the new segment.
    pub data: SegmentData,
    /// One map per input reader, in input order.
    pub doc_maps: Vec<DocMap>,
}

/// Merges segment readers.
#[derive(Debug)]
pub struct SegmentMerger<'a> {
    readers: &'a [SegmentReader],
    field_numbers: &'a FieldNumbers,
}

fn extend_column<T: Clone>(column: &mut Vec<T>, base: u32, values: &[T], map: &DocMap, fill: T) {
    column.resize(base as usize, fill.clone());
    for (doc, value) in values.iter().enumerate() {
        if map.get(doc as u32).is_some() {
            column.push(value.clone());
        }
    }
    // values shorter than the segment leave gaps
    let live = map.num_live() as usize;
    column.resize(base as usize + live, fill);
}

impl<'a> SegmentMerger<'a> {
    /// Merger over `readers`, registering fields in `field_numbers`.
    pub fn new(readers: &'a [SegmentReader], field_numbers: &'a FieldNumbers) -> Self {
        SegmentMerger {
            readers,
            field_numbers,
        }
    }

    /// Merge all readers. Checks `merge` for pause and abort before each
    /// segment.
    pub fn merge(&self, merge: &OneMerge) -> Result<MergedSegment> {
        let mut field_infos = FieldInfosBuilder::new();
        let mut postings: BTreeMap<String, BTreeMap<String, Vec<Posting>>> = BTreeMap::new();
        let mut norms: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        let mut numeric: BTreeMap<String, Vec<Option<i64>>> = BTreeMap::new();
        let mut binary: BTreeMap<String, Vec<Option<Vec<u8>>>> = BTreeMap::new();
        let mut stored = Vec::new();
        let mut doc_maps = Vec::with_capacity(self.readers.len());
        let mut base = 0u32;

        for reader in self.readers {
            merge.check_aborted()?;
            let map = DocMap::build(reader, base);
            debug!(
                "merging {}: {} of {} docs live, base {base}",
                reader.name(),
                map.num_live(),
                reader.max_doc()
            );

            field_infos.add_all(self.field_numbers, reader.field_infos())?;

            for (field, terms) in &reader.core().postings {
                let merged_terms = postings.entry(field.clone()).or_default();
                for (text, list) in terms {
                    let remapped: Vec<Posting> = list
                        .iter()
                        .filter_map(|p| {
                            map.get(p.doc)
                                .map(|doc| Posting::new(doc, p.positions.clone()))
                        })
                        .collect();
                    if !remapped.is_empty() {
                        merged_terms
                            .entry(text.clone())
                            .or_default()
                            .extend(remapped);
                    }
                }
            }

            for (field, column) in &reader.core().norms {
                extend_column(norms.entry(field.clone()).or_default(), base, column, &map, 0);
            }

            let columns = reader.doc_values_columns();
            for (field, column) in &columns.numeric {
                extend_column(numeric.entry(field.clone()).or_default(), base, column, &map, None);
            }
            for (field, column) in &columns.binary {
                extend_column(binary.entry(field.clone()).or_default(), base, column, &map, None);
            }

            for doc in 0..reader.max_doc() {
                if map.get(doc).is_some() {
                    stored.push(reader.stored_fields(doc).to_vec());
                }
            }

            base += map.num_live();
            doc_maps.push(map);
        }

        postings.retain(|_, terms| !terms.is_empty());
        for column in norms.values_mut() {
            column.resize(base as usize, 0);
        }
        for column in numeric.values_mut() {
            column.resize(base as usize, None);
        }
        for column in binary.values_mut() {
            column.resize(base as usize, None);
        }

        info!(
            "merged {} segments into {base} docs ({} fields)",
            self.readers.len(),
            postings.len()
        );

        Ok(MergedSegment {
            data: SegmentData {
                max_doc: base,
                field_infos: field_infos.finish(),
                postings,
                norms,
                numeric_doc_values: numeric,
                binary_doc_values: binary,
                stored,
            },
            doc_maps,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::document::field::FieldValue;
    use crate::index::codec::StoredField;
    use crate::index::live_docs::LiveDocs;
    use crate::index::segment::{SegmentCommitInfo, SegmentInfo};

    fn reader(name: &str, ids: &[&str]) -> SegmentReader {
        let mut data = SegmentData::new(ids.len() as u32);
        let mut terms = BTreeMap::new();
        for (doc, id) in ids.iter().enumerate() {
            terms.insert(id.to_string(), vec![Posting::new(doc as u32, vec![0])]);
            data.stored[doc] = vec![StoredField {
                name: "id".into(),
                value: FieldValue::Keyword(id.to_string()),
            }];
        }
        data.postings.insert("id".into(), terms);
        data.norms.insert("id".into(), vec![1; ids.len()]);
        data.numeric_doc_values.insert(
            "rank".into(),
            (0..ids.len()).map(|d| Some(d as i64 * 10)).collect(),
        );
        let info = Arc::new(SegmentCommitInfo::new(SegmentInfo::new(name, ids.len() as u32, "default")));
        SegmentReader::from_data(info, Arc::new(data))
    }

    #[test]
    fn test_merge_drops_deleted_docs_and_renumbers() {
        let first = reader("_0", &["a", "b", "c"]);
        let mut live = LiveDocs::all_live(3);
        live.delete(1);
        let first = first.with_live_docs(Some(Arc::new(live)), 2);
        let second = reader("_1", &["d", "e"]);
        let readers = vec![first, second];

        let merge = OneMerge::new(readers.iter().map(|r| r.info().clone()).collect());
        let field_numbers = FieldNumbers::new();
        let merged = SegmentMerger::new(&readers, &field_numbers)
            .merge(&merge)
            .unwrap();

        assert_eq!(merged.data.max_doc, 4);
        let ids = &merged.data.postings["id"];
        assert!(!ids.contains_key("b"));
        assert_eq!(ids["c"][0].doc, 1);
        assert_eq!(ids["e"][0].doc, 3);
        assert_eq!(merged.data.numeric_doc_values["rank"], vec![Some(0), Some(20), Some(0), Some(10)]);
        assert_eq!(merged.data.norms["id"].len(), 4);
        assert_eq!(merged.data.stored.len(), 4);

        assert_eq!(merged.doc_maps[0].get(1), None);
        assert_eq!(merged.doc_maps[0].get(2), Some(1));
        assert_eq!(merged.doc_maps[1].get(0), Some(2));
        assert_eq!(merged.doc_maps[1].num_live(), 2);
    }

    #[test]
    fn test_missing_columns_are_padded() {
        let mut without_dv = reader("_0", &["a", "b"]);
        without_dv = {
            let mut data = without_dv.core().as_ref().clone();
            data.numeric_doc_values.clear();
            SegmentReader::from_data(without_dv.info().clone(), Arc::new(data))
        };
        let readers = vec![without_dv, reader("_1", &["c"])];
        let merge = OneMerge::new(readers.iter().map(|r| r.info().clone()).collect());
        let field_numbers = FieldNumbers::new();
        let merged = SegmentMerger::new(&readers, &field_numbers)
            .merge(&merge)
            .unwrap();
        assert_eq!(merged.data.numeric_doc_values["rank"], vec![None, None, Some(0)]);
    }

    #[test]
    fn test_aborted_merge_stops() {
        let readers = vec![reader("_0", &["a"])];
        let merge = OneMerge::new(readers.iter().map(|r| r.info().clone()).collect());
        merge.abort();
        let field_numbers = FieldNumbers::new();
        let err = SegmentMerger::new(&readers, &field_numbers)
            .merge(&merge)
            .unwrap_err();
        assert!(err.is_merge_aborted());
    }
}
