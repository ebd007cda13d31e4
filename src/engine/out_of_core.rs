use super::query::{Aggregation, CastColumn, JoinKind, Query, QueryFragment};
use crate::error::Result;
use crate::expr::{BinaryOp, Expr, Literal};
use crate::operation::aggregate::AggFunction;
use crate::schema::{ColumnType, Schema};
use crate::source::{ChunkedSource, Chunks};
use crate::table::Table;
use polars::prelude::{
    CsvWriter, DataType, Expr as PlExpr, Field, JoinArgs, JoinType, LazyCsvReader,
    LazyFileListReader as _, LazyFrame, NULL, Schema as PlSchema, SerWriter as _,
    SortMultipleOptions, UnionArgs, col, concat, lit, when,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const LEFT_ROW: &str = "__tabflow_left_row";
const RIGHT_ROW: &str = "__tabflow_right_row";

/// Integral doubles below this magnitude render without a fractional part.
const INTEGRAL_RENDER_LIMIT: f64 = 1e15;

/// Runs [`Query`]s with polars lazy frames, streaming the result through a
/// scratch CSV file so the caller sees the same chunked [`Table`] stream as
/// the in-memory path.
#[derive(Debug, Clone, Default)]
pub struct OutOfCoreEngine {
    scratch_dir: Option<PathBuf>,
}

impl OutOfCoreEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place scratch files in `dir` instead of the system temp directory.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Execute `query`, returning its rows in chunks of `chunk_rows`.
    pub fn run(&self, query: &Query, chunk_rows: usize) -> Result<Chunks> {
        let lf = self.build(query)?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("tabflow-").suffix(".csv");
        let scratch = match &self.scratch_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }?
        .into_temp_path();

        info!(
            source = %query.source.display(),
            fragments = query.fragments.len(),
            "Running out-of-core query"
        );
        sink(lf, &scratch)?;

        let chunks = ChunkedSource::open(&scratch)?
            .iter_chunks(query.output_schema.clone(), chunk_rows)?
            .owning(scratch);
        Ok(chunks)
    }

    /// Execute `query` and materialise the result.
    pub fn collect(&self, query: &Query) -> Result<Table> {
        let chunks = self.run(query, 65_536)?;
        Table::concat(query.output_schema.clone(), chunks)
    }

    /// Translate `query` into a lazy frame without running it.
    pub fn build(&self, query: &Query) -> Result<LazyFrame> {
        let mut lf = scan(&query.source, &query.source_schema)?;
        for fragment in &query.fragments {
            debug!(fragment = fragment.kind(), "Translating query fragment");
            lf = apply(lf, fragment)?;
        }
        Ok(lf)
    }
}

fn sink(lf: LazyFrame, path: &Path) -> Result<()> {
    let fallback = lf.clone();
    match lf
        .with_streaming(true)
        .sink_csv(path, Default::default(), None)
    {
        Ok(()) => Ok(()),
        Err(e) => {
            // Plans the streaming sink cannot run still execute lazily in one go.
            warn!(error = %e, "Streaming sink unavailable, collecting query result");
            let mut df = fallback.with_streaming(true).collect()?;
            let mut file = std::fs::File::create(path)?;
            CsvWriter::new(&mut file)
                .include_header(true)
                .finish(&mut df)?;
            Ok(())
        }
    }
}

fn dtype(kind: ColumnType) -> DataType {
    match kind {
        ColumnType::Number => DataType::Float64,
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::String | ColumnType::Temporal | ColumnType::Unknown => DataType::String,
    }
}

/// Lazy scan with every column type pinned, so cells that do not parse
/// become null exactly as they do in the in-memory reader.
fn scan(path: &Path, schema: &Schema) -> Result<LazyFrame> {
    let fields: PlSchema = schema
        .iter()
        .map(|c| Field::new(c.name.as_str().into(), dtype(c.kind)))
        .collect();
    let lf = LazyCsvReader::new(path)
        .with_has_header(true)
        .with_schema(Some(Arc::new(fields)))
        .with_ignore_errors(true)
        .finish()?;
    Ok(lf)
}

fn columns(names: &[String]) -> Vec<PlExpr> {
    names.iter().map(|n| col(n.as_str())).collect()
}

fn apply(lf: LazyFrame, fragment: &QueryFragment) -> Result<LazyFrame> {
    let lf = match fragment {
        QueryFragment::Filter(predicate) => lf.filter(translate(predicate)),
        QueryFragment::Select(names) => lf.select(columns(names)),
        QueryFragment::Rename(pairs) => lf.select(
            pairs
                .iter()
                .map(|(old, new)| col(old.as_str()).alias(new.as_str()))
                .collect::<Vec<_>>(),
        ),
        QueryFragment::WithColumn { name, expr } => {
            lf.with_column(translate(expr).alias(name.as_str()))
        }
        QueryFragment::Cast(casts) => lf.with_columns(casts.iter().map(cast).collect::<Vec<_>>()),
        QueryFragment::Aggregate { by, aggregations } => {
            let aggs: Vec<PlExpr> = aggregations.iter().map(aggregate).collect();
            if by.is_empty() {
                lf.select(aggs)
            } else {
                lf.group_by_stable(columns(by)).agg(aggs)
            }
        }
        QueryFragment::Sort { by, descending } => lf.sort_by_exprs(
            columns(by),
            SortMultipleOptions::default()
                .with_order_descending_multi(descending.clone())
                .with_nulls_last(true)
                .with_maintain_order(true),
        ),
        QueryFragment::Join {
            right,
            right_schema,
            left_on,
            right_on,
            how,
            columns: output,
        } => {
            let how = match how {
                JoinKind::Inner => JoinType::Inner,
                JoinKind::Left => JoinType::Left,
            };
            let right = scan(right, right_schema)?.with_row_index(RIGHT_ROW, None);
            lf.with_row_index(LEFT_ROW, None)
                .join(right, columns(left_on), columns(right_on), JoinArgs::new(how))
                .sort_by_exprs(
                    [col(LEFT_ROW), col(RIGHT_ROW)],
                    SortMultipleOptions::default()
                        .with_nulls_last(true)
                        .with_maintain_order(true),
                )
                .select(columns(output))
        }
        QueryFragment::Append { sources, schema } => {
            let mut frames = vec![lf];
            for source in sources {
                frames.push(scan(source, schema)?);
            }
            concat(frames, UnionArgs::default())?
        }
    };
    Ok(lf)
}

fn aggregate(agg: &Aggregation) -> PlExpr {
    let c = col(agg.column.as_str());
    let expr = match agg.function {
        AggFunction::Sum => c.sum(),
        AggFunction::Mean => c.mean(),
        AggFunction::Min => c.min(),
        AggFunction::Max => c.max(),
        AggFunction::Count => c.count(),
        AggFunction::First => c.first(),
    };
    expr.alias(agg.alias.as_str())
}

fn cast(spec: &CastColumn) -> PlExpr {
    let c = col(spec.name.as_str());
    let expr = match (spec.from, spec.to) {
        (from, to) if from == to => c,
        (ColumnType::Number, ColumnType::String) => {
            // Whole numbers render without a trailing ".0".
            let whole = c
                .clone()
                .eq(c.clone().floor())
                .and(c.clone().abs().lt(lit(INTEGRAL_RENDER_LIMIT)));
            when(whole)
                .then(c.clone().cast(DataType::Int64).cast(DataType::String))
                .otherwise(c.cast(DataType::String))
        }
        (ColumnType::Number, ColumnType::Boolean) => c.neq(lit(0.0)),
        (from, ColumnType::Boolean) if from.is_text_like() => when(c.clone().eq(lit("true")))
            .then(lit(true))
            .when(c.eq(lit("false")))
            .then(lit(false))
            .otherwise(lit(NULL).cast(DataType::Boolean)),
        (from, to) if from.is_text_like() && to.is_text_like() => c,
        (_, to) => c.cast(dtype(to)),
    };
    expr.alias(spec.name.as_str())
}

/// Translate an expression tree. Polars follows the same three-valued logic
/// for comparisons and boolean connectives.
fn translate(expr: &Expr) -> PlExpr {
    match expr {
        Expr::Column(name) => col(name.as_str()),
        Expr::Literal(Literal::Null(())) => lit(NULL),
        Expr::Literal(Literal::Bool(b)) => lit(*b),
        Expr::Literal(Literal::Number(n)) => lit(*n),
        Expr::Literal(Literal::Text(s)) => lit(s.as_str()),
        Expr::Not(inner) => translate(inner).not(),
        Expr::IsNull(inner) => translate(inner).is_null(),
        Expr::Binary { op, left, right } => {
            let l = translate(left);
            let r = translate(right);
            match op {
                BinaryOp::Add => l + r,
                BinaryOp::Sub => l - r,
                BinaryOp::Mul => l * r,
                BinaryOp::Div => l / r,
                BinaryOp::Eq => l.eq(r),
                BinaryOp::Neq => l.neq(r),
                BinaryOp::Lt => l.lt(r),
                BinaryOp::LtEq => l.lt_eq(r),
                BinaryOp::Gt => l.gt(r),
                BinaryOp::GtEq => l.gt_eq(r),
                BinaryOp::And => l.and(r),
                BinaryOp::Or => l.or(r),
            }
        }
    }
}
