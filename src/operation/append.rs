use super::{
    Capabilities, Category, Chunking, ExecContext, Operation, Params, Validation, parse_params,
    to_params,
};
use crate::engine::QueryFragment;
use crate::error::{PipelineError, Result, ResultExt as _};
use crate::registry::{OperationDescriptor, ParamKind, ParamSpec};
use crate::schema::Schema;
use crate::source::ChunkedSource;
use crate::table::Table;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Exported chunk files: `name.csv`, `name(1).csv`, `name(2).csv`, ...
const CHUNK_PATTERN: &str = r"(?i)^(?P<base>.+?)(\((?P<idx>\d+)\))?\.csv$";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendParams {
    pub sources: Vec<PathBuf>,
}

/// Concatenate further files below the running table. Every appended file
/// must have exactly the running column names, in order; its cells are read
/// with the running column types.
#[derive(Debug, Clone)]
pub struct AppendSources {
    params: AppendParams,
}

impl AppendSources {
    pub const NAME: &'static str = "append_sources";

    pub fn new(sources: Vec<PathBuf>) -> Self {
        Self {
            params: AppendParams { sources },
        }
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Ok(Self {
            params: parse_params(Self::NAME, params)?,
        })
    }

    pub fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::NAME, "Append files", Category::Source).param(
            "sources",
            ParamSpec::required(ParamKind::StringList, "Files with the same columns"),
        )
    }
}

impl Operation for AppendSources {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn category(&self) -> Category {
        Category::Source
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            out_of_core: true,
            chunking: Chunking::Materialize,
        }
    }

    fn params(&self) -> Params {
        to_params(&self.params)
    }

    fn describe(&self) -> String {
        format!("Append {} file(s)", self.params.sources.len())
    }

    fn check_params(&self) -> Vec<String> {
        if self.params.sources.is_empty() {
            vec!["at least one file to append is required".to_owned()]
        } else {
            Vec::new()
        }
    }

    fn validate(&self, input: &Schema) -> Validation {
        let mut v = Validation::default();
        for problem in self.check_params() {
            v.config_error(problem);
        }
        for path in &self.params.sources {
            match ChunkedSource::open(path).and_then(|s| s.read_schema()) {
                Ok(header) if header.names() == input.names() => {}
                Ok(header) => v.schema_error(format!(
                    "{} has columns {:?}, expected {:?}",
                    path.display(),
                    header.names(),
                    input.names()
                )),
                Err(e) => v.config_error(e.to_string()),
            }
        }
        v
    }

    fn output_schema(&self, input: &Schema) -> Result<Schema> {
        Ok(input.clone())
    }

    fn execute(&self, input: Table, ctx: &ExecContext<'_>) -> Result<Table> {
        let mut out = input;
        for path in &self.params.sources {
            ctx.cancel.check()?;
            let schema = out.schema().clone();
            out.append(ChunkedSource::open(path)?.read_all(&schema)?)?;
        }
        Ok(out)
    }

    fn query_fragment(&self, input: &Schema) -> Option<QueryFragment> {
        Some(QueryFragment::Append {
            sources: self.params.sources.clone(),
            schema: input.clone(),
        })
    }
}

/// Files split from one export, in chunk order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkGroup {
    /// File name without the chunk index and extension, trimmed.
    pub base: String,
    pub files: Vec<PathBuf>,
}

impl ChunkGroup {
    /// The chunk a pipeline over the group reads as its source.
    pub fn first(&self) -> Option<&Path> {
        self.files.first().map(PathBuf::as_path)
    }

    /// The chunks an `append_sources` step adds below the first one.
    pub fn rest(&self) -> &[PathBuf] {
        self.files.get(1..).unwrap_or_default()
    }
}

/// Find chunk groups anywhere under `dir`. Groups are sorted by base name; a
/// file without an index counts as chunk 0.
pub fn chunk_groups(dir: &Path) -> Result<Vec<ChunkGroup>> {
    let pattern = Regex::new(CHUNK_PATTERN).map_err(|e| PipelineError::Other(e.to_string()))?;
    let mut files = Vec::new();
    collect_files(dir, &mut files)?;

    let mut groups: BTreeMap<String, Vec<(u64, PathBuf)>> = BTreeMap::new();
    for path in files {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let Some(caps) = pattern.captures(&name) else {
            continue;
        };
        let base = caps["base"].trim().to_owned();
        let order = caps
            .name("idx")
            .and_then(|idx| idx.as_str().parse().ok())
            .unwrap_or(0);
        groups.entry(base).or_default().push((order, path));
    }

    let groups: Vec<ChunkGroup> = groups
        .into_iter()
        .map(|(base, mut files)| {
            files.sort();
            ChunkGroup {
                base,
                files: files.into_iter().map(|(_, path)| path).collect(),
            }
        })
        .collect();
    debug!(dir = %dir.display(), groups = groups.len(), "Found chunk groups");
    Ok(groups)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir).for_source(dir)? {
        let path = entry.for_source(dir)?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

/// Write every chunk of `group` into `output`: one header, then each chunk's
/// rows in chunk order, field text untouched. Returns the number of rows.
pub fn merge_chunk_group(group: &ChunkGroup, output: &Path) -> Result<u64> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).for_destination(parent)?;
    }
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_path(output)
        .for_destination(output)?;

    let mut header: Option<csv::StringRecord> = None;
    let mut rows = 0_u64;
    for path in &group.files {
        let mut reader = csv::Reader::from_path(path).for_source(path)?;
        let this = reader.headers().for_source(path)?.clone();
        match &header {
            Some(expected) if *expected != this => {
                return Err(PipelineError::source_error(
                    path,
                    format!("header {this:?} differs from the first chunk's {expected:?}"),
                ));
            }
            Some(_) => {}
            None => {
                writer.write_record(&this).for_destination(output)?;
                header = Some(this);
            }
        }
        for record in reader.records() {
            writer
                .write_record(&record.for_source(path)?)
                .for_destination(output)?;
            rows += 1;
        }
    }
    writer.flush().for_destination(output)?;
    info!(
        base = %group.base,
        files = group.files.len(),
        rows,
        output = %output.display(),
        "Merged chunk group"
    );
    Ok(rows)
}
