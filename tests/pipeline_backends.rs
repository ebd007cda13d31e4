//! Integration tests for pipeline execution across backends
//!
//! Each test writes its own CSV fixture into a temp dir, builds a pipeline
//! through the registry and checks that every backend agrees.

use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tabflow::cancel::CancellationToken;
use tabflow::config::{BackendPreference, EngineConfig};
use tabflow::error::PipelineError;
use tabflow::operation::append::{chunk_groups, merge_chunk_group};
use tabflow::pipeline::{Backend, Execution, Output, Pipeline, PipelineBuilder, PipelineSpec};
use tabflow::registry::Registry;
use tabflow::table::Table;

fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("write fixture");
    path
}

fn forced(backend: BackendPreference, chunk_rows: usize) -> EngineConfig {
    EngineConfig {
        backend,
        chunk_rows,
        ..EngineConfig::default()
    }
}

fn orders(dir: &Path) -> PathBuf {
    write(
        dir,
        "orders.csv",
        "store,region,amount,qty\n\
         A,north,1200,2\n\
         B,south,800,1\n\
         A,north,3000,\n\
         C,east,1500,4\n\
         B,south,2500,3\n\
         C,,999,1\n\
         A,west,,2\n",
    )
}

fn filter_then_sum<'r>(registry: &'r Registry, source: &Path) -> PipelineBuilder<'r> {
    PipelineBuilder::new(registry, source)
        .step_json(
            "filter",
            json!({"predicate": {"binary": {
                "op": "gt", "left": {"column": "amount"}, "right": {"literal": 1000}
            }}}),
        )
        .step_json(
            "group_by",
            json!({"by": ["store"], "aggregations": [
                {"column": "amount", "function": "sum"},
                {"column": "qty", "function": "count"}
            ]}),
        )
}

fn run(builder: PipelineBuilder<'_>, config: EngineConfig) -> (Backend, Table) {
    let pipeline = builder.config(config).build().expect("pipeline builds");
    let execution = pipeline
        .execute(&CancellationToken::new())
        .expect("pipeline runs");
    let backend = execution.backend;
    (backend, execution.collect().expect("output collects"))
}

/// Run `chain` on every backend, check they agree and return the result.
fn agree_across_backends<'r>(chain: impl Fn() -> PipelineBuilder<'r>) -> Table {
    let (_, in_memory) = run(chain(), forced(BackendPreference::InMemory, 50_000));
    let (backend, out_of_core) = run(chain(), forced(BackendPreference::OutOfCore, 2));
    assert_eq!(backend, Backend::OutOfCore);
    let (_, chunked) = run(chain(), forced(BackendPreference::Chunked, 2));
    assert_eq!(out_of_core, in_memory, "out-of-core");
    assert_eq!(chunked, in_memory, "chunked");
    in_memory
}

#[test]
fn test_in_memory_and_out_of_core_agree() {
    let dir = tempfile::tempdir().expect("temp dir");
    let registry = Registry::with_builtins();
    let source = orders(dir.path());

    let (backend, in_memory) = run(
        filter_then_sum(&registry, &source),
        forced(BackendPreference::InMemory, 50_000),
    );
    assert_eq!(backend, Backend::InMemory);

    let (backend, out_of_core) = run(
        filter_then_sum(&registry, &source),
        forced(BackendPreference::OutOfCore, 50_000),
    );
    assert_eq!(backend, Backend::OutOfCore);

    assert_eq!(in_memory.schema().names(), vec!["store", "amount_sum", "qty_count"]);
    assert_eq!(out_of_core, in_memory);
    assert_eq!(
        in_memory.to_text(),
        vec![
            vec!["A", "4200", "1"],
            vec!["C", "1500", "1"],
            vec!["B", "2500", "1"],
        ]
    );
}

#[test]
fn test_row_wise_chain_agrees_across_backends() {
    let dir = tempfile::tempdir().expect("temp dir");
    let registry = Registry::with_builtins();
    let source = orders(dir.path());
    let chain = || {
        PipelineBuilder::new(&registry, &source)
            .step_json("rename_columns", json!({"mapping": {"amount": "value"}}))
            .step_json(
                "compute_column",
                json!({"name": "unit", "expr": {"binary": {
                    "op": "div", "left": {"column": "value"}, "right": {"column": "qty"}
                }}}),
            )
            .step_json("drop_columns", json!({"columns": ["region"]}))
            .step_json("sort", json!({"by": ["unit"], "descending": [true]}))
    };

    let (_, in_memory) = run(chain(), forced(BackendPreference::InMemory, 50_000));
    let (_, out_of_core) = run(chain(), forced(BackendPreference::OutOfCore, 50_000));
    let (_, chunked) = run(chain(), forced(BackendPreference::Chunked, 2));

    assert_eq!(in_memory.schema().names(), vec!["store", "value", "qty", "unit"]);
    assert_eq!(out_of_core, in_memory);
    assert_eq!(chunked, in_memory);
    // nulls sort last
    assert_eq!(in_memory.len(), 7);
    assert!(in_memory.rows()[5][3].is_null());
    assert!(in_memory.rows()[6][3].is_null());
}

#[test]
fn test_chunk_size_does_not_change_output() {
    let dir = tempfile::tempdir().expect("temp dir");
    let registry = Registry::with_builtins();
    let source = orders(dir.path());

    let (_, reference) = run(
        filter_then_sum(&registry, &source),
        forced(BackendPreference::Chunked, 50_000),
    );
    for chunk_rows in [1, 2, 3, 7] {
        let (backend, table) = run(
            filter_then_sum(&registry, &source),
            forced(BackendPreference::Chunked, chunk_rows),
        );
        assert_eq!(backend, Backend::Chunked);
        assert_eq!(table, reference, "chunk_rows = {chunk_rows}");
    }
}

#[test]
fn test_three_step_schema_prediction_matches_result() {
    let dir = tempfile::tempdir().expect("temp dir");
    let registry = Registry::with_builtins();
    let source = orders(dir.path());
    let pipeline = PipelineBuilder::new(&registry, &source)
        .step_json("select_columns", json!({"columns": ["store", "amount", "qty"]}))
        .step_json(
            "compute_column",
            json!({"name": "line_total", "expr": {"binary": {
                "op": "mul", "left": {"column": "amount"}, "right": {"column": "qty"}
            }}}),
        )
        .step_json(
            "group_by",
            json!({"by": ["store"], "aggregations": [
                {"column": "line_total", "function": "max"},
                {"column": "amount", "function": "mean", "alias": "avg_amount"}
            ]}),
        )
        .build()
        .expect("pipeline builds");

    let predicted = pipeline.output_schema().clone();
    assert_eq!(predicted.names(), vec!["store", "line_total_max", "avg_amount"]);

    for backend in [
        BackendPreference::InMemory,
        BackendPreference::Chunked,
        BackendPreference::OutOfCore,
    ] {
        let spec = pipeline.to_spec();
        let replayed = Pipeline::from_spec(&registry, &spec, forced(backend, 2))
            .expect("spec replays");
        let result = replayed
            .execute(&CancellationToken::new())
            .and_then(Execution::collect)
            .expect("pipeline runs");
        assert_eq!(result.schema(), &predicted, "{backend:?}");
    }
}

#[test]
fn test_saved_pipeline_drifts_on_new_source() {
    let dir = tempfile::tempdir().expect("temp dir");
    let registry = Registry::with_builtins();
    let spec_path = dir.path().join("recipe.json");
    filter_then_sum(&registry, &orders(dir.path()))
        .build()
        .expect("pipeline builds")
        .to_spec()
        .to_file(&spec_path)
        .expect("spec saves");

    let renamed = write(dir.path(), "renamed.csv", "shop,amount,qty\nA,2000,1\n");
    let spec = PipelineSpec::from_file(&spec_path).expect("spec loads");
    let err = Pipeline::from_spec_with_source(&registry, &spec, &renamed, EngineConfig::default())
        .expect_err("store column is gone");
    assert!(matches!(err, PipelineError::SchemaDrift { step: 1, .. }), "{err}");
}

#[test]
fn test_cancellation_stops_between_chunks() {
    let dir = tempfile::tempdir().expect("temp dir");
    let registry = Registry::with_builtins();
    let pipeline = PipelineBuilder::new(&registry, orders(dir.path()))
        .config(forced(BackendPreference::Chunked, 2))
        .step_json("drop_columns", json!({"columns": ["region"]}))
        .build()
        .expect("pipeline builds");

    let token = CancellationToken::new();
    let execution = pipeline.execute(&token).expect("pipeline starts");
    let Output::Stream(mut stream) = execution.output else {
        panic!("row-wise chain should stream");
    };
    let first = stream.next().expect("one chunk").expect("chunk ok");
    assert_eq!(first.len(), 2);

    token.cancel();
    assert!(matches!(stream.next(), Some(Err(PipelineError::Cancelled))));
    assert!(stream.next().is_none());
}

#[test]
fn test_partition_step_fans_out_a_batch() {
    let input = tempfile::tempdir().expect("temp dir");
    let output = tempfile::tempdir().expect("temp dir");
    let registry = Registry::with_builtins();
    let a = write(input.path(), "a.csv", "storeId,amount\n1,100\n2,50\n1,30\n");
    let b = write(input.path(), "b.csv", "storeId,amount\n2,7\n");
    let c = write(input.path(), "c.csv", "shop,amount\n1,1\n");

    let pipeline = PipelineBuilder::new(&registry, &a)
        .step_json(
            "partition_by",
            json!({"column": "storeId", "output_dir": output.path()}),
        )
        .build()
        .expect("pipeline builds");
    let report = pipeline
        .execute_batch([&a, &b, &c], &CancellationToken::new())
        .expect("batch runs");

    assert_eq!(report.completed.len(), 2);
    assert_eq!(report.rows(), 4);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].path, c);

    let read = |key: &str, file: &str| {
        std::fs::read_to_string(output.path().join(key).join(file)).expect("destination exists")
    };
    assert_eq!(read("1", "a.csv"), "storeId,amount\n1,100\n1,30\n");
    assert_eq!(read("2", "a.csv"), "storeId,amount\n2,50\n");
    assert_eq!(read("2", "b.csv"), "storeId,amount\n2,7\n");
    assert!(!output.path().join("1").join("c.csv").exists());
}

fn join_fixture(dir: &Path) -> (PathBuf, PathBuf) {
    let left = write(
        dir,
        "left.csv",
        "store,region,amount\nA,north,10\n,south,20\nB,south,30\nD,east,40\n",
    );
    let right = write(
        dir,
        "managers.csv",
        "store,region,manager\nA,n1,Ann\nB,s1,Bo\nA,n2,Al\n,x,Nobody\n",
    );
    (left, right)
}

#[test]
fn test_inner_join_agrees_across_backends() {
    let dir = tempfile::tempdir().expect("temp dir");
    let registry = Registry::with_builtins();
    let (left, right) = join_fixture(dir.path());

    let table = agree_across_backends(|| {
        PipelineBuilder::new(&registry, &left).step_json(
            "join",
            json!({"right": right, "left_on": ["store"], "how": "inner"}),
        )
    });
    assert_eq!(
        table.schema().names(),
        vec!["store", "region", "amount", "region_right", "manager"]
    );
    // blank keys never match, left order then right order
    assert_eq!(
        table.to_text(),
        vec![
            vec!["A", "north", "10", "n1", "Ann"],
            vec!["A", "north", "10", "n2", "Al"],
            vec!["B", "south", "30", "s1", "Bo"],
        ]
    );
}

#[test]
fn test_left_join_agrees_across_backends() {
    let dir = tempfile::tempdir().expect("temp dir");
    let registry = Registry::with_builtins();
    let (left, right) = join_fixture(dir.path());

    let table = agree_across_backends(|| {
        PipelineBuilder::new(&registry, &left).step_json(
            "join",
            json!({"right": right, "left_on": ["store"], "right_on": ["store"], "how": "left"}),
        )
    });
    assert_eq!(
        table.to_text(),
        vec![
            vec!["A", "north", "10", "n1", "Ann"],
            vec!["A", "north", "10", "n2", "Al"],
            vec!["", "south", "20", "", ""],
            vec!["B", "south", "30", "s1", "Bo"],
            vec!["D", "east", "40", "", ""],
        ]
    );
}

#[test]
fn test_cast_types_agrees_across_backends() {
    let dir = tempfile::tempdir().expect("temp dir");
    let registry = Registry::with_builtins();
    let source = write(
        dir.path(),
        "prices.csv",
        "code,price\n12,1.5\nabc,2\n,100\n3.5,\n",
    );

    let table = agree_across_backends(|| {
        PipelineBuilder::new(&registry, &source).step_json(
            "cast_types",
            json!({"columns": {"code": "number", "price": "string"}}),
        )
    });
    // unparseable text becomes null, whole numbers render without ".0"
    assert_eq!(
        table.to_text(),
        vec![
            vec!["12", "1.5"],
            vec!["", "2"],
            vec!["", "100"],
            vec!["3.5", ""],
        ]
    );
    assert!(table.rows()[1][0].is_null());
}

#[test]
fn test_append_sources_agrees_across_backends() {
    let dir = tempfile::tempdir().expect("temp dir");
    let registry = Registry::with_builtins();
    let source = orders(dir.path());
    let more = write(
        dir.path(),
        "more.csv",
        "store,region,amount,qty\nD,north,5,1\nE,,oops,2\n",
    );

    let table = agree_across_backends(|| {
        PipelineBuilder::new(&registry, &source)
            .step_json("append_sources", json!({"sources": [&more]}))
    });
    assert_eq!(table.len(), 9);
    assert_eq!(table.to_text()[7], vec!["D", "north", "5", "1"]);
    // appended cells are read with the running column types
    assert!(table.rows()[8][2].is_null());
}

#[test]
fn test_select_columns_agrees_across_backends() {
    let dir = tempfile::tempdir().expect("temp dir");
    let registry = Registry::with_builtins();
    let source = orders(dir.path());

    let table = agree_across_backends(|| {
        PipelineBuilder::new(&registry, &source)
            .step_json("select_columns", json!({"columns": ["qty", "store"]}))
    });
    assert_eq!(table.schema().names(), vec!["qty", "store"]);
    assert_eq!(table.to_text()[0], vec!["2", "A"]);
    assert_eq!(table.to_text()[2], vec!["", "A"]);
}

#[test]
fn test_chunk_group_feeds_append_sources() {
    let dir = tempfile::tempdir().expect("temp dir");
    let registry = Registry::with_builtins();
    write(dir.path(), "orders(1).csv", "store,amount\nB,20\n");
    write(dir.path(), "orders.csv", "store,amount\nA,10\n");
    write(dir.path(), "orders(2).csv", "store,amount\nA,5\n");

    let groups = chunk_groups(dir.path()).expect("groups found");
    assert_eq!(groups.len(), 1);
    let group = &groups[0];
    let first = group.first().expect("group has a first chunk");

    let table = agree_across_backends(|| {
        PipelineBuilder::new(&registry, first)
            .step_json("append_sources", json!({"sources": group.rest()}))
            .step_json(
                "group_by",
                json!({"by": ["store"], "aggregations": [{"column": "amount", "function": "sum"}]}),
            )
    });
    assert_eq!(table.to_text(), vec![vec!["A", "15"], vec!["B", "20"]]);

    let merged = dir.path().join("merged").join("orders.csv");
    assert_eq!(merge_chunk_group(group, &merged).expect("group merges"), 3);
    assert_eq!(
        std::fs::read_to_string(&merged).expect("merged file"),
        "store,amount\nA,10\nB,20\nA,5\n"
    );
}

fn partition<'r>(registry: &'r Registry, source: &Path, output: &Path) -> PipelineBuilder<'r> {
    PipelineBuilder::new(registry, source).step_json(
        "partition_by",
        json!({"column": "storeId", "output_dir": output}),
    )
}

#[test]
fn test_partition_writes_keys_and_rows_as_read() {
    let input = tempfile::tempdir().expect("temp dir");
    let registry = Registry::with_builtins();
    let source = write(input.path(), "a.csv", "storeId,amount\n007,1.50\n7,2.00\n");

    for backend in [BackendPreference::InMemory, BackendPreference::Chunked] {
        let output = tempfile::tempdir().expect("temp dir");
        let chain = PipelineBuilder::new(&registry, &source)
            .step_json(
                "filter",
                json!({"predicate": {"binary": {
                    "op": "gt", "left": {"column": "amount"}, "right": {"literal": 0}
                }}}),
            )
            .step_json(
                "partition_by",
                json!({"column": "storeId", "output_dir": output.path()}),
            );
        let (_, table) = run(chain, forced(backend, 1));
        assert_eq!(table.len(), 2);
        let read = |key: &str| {
            std::fs::read_to_string(output.path().join(key).join("a.csv"))
                .expect("destination exists")
        };
        assert_eq!(read("007"), "storeId,amount\n007,1.50\n", "{backend:?}");
        assert_eq!(read("7"), "storeId,amount\n7,2.00\n", "{backend:?}");
    }
}

#[test]
fn test_partition_has_no_out_of_core_form() {
    let dir = tempfile::tempdir().expect("temp dir");
    let registry = Registry::with_builtins();
    let source = write(dir.path(), "a.csv", "storeId,amount\n1,100\n");
    let pipeline = partition(&registry, &source, &dir.path().join("out"))
        .config(forced(BackendPreference::OutOfCore, 50_000))
        .build()
        .expect("pipeline builds");
    let err = pipeline
        .execute(&CancellationToken::new())
        .expect_err("partition_by cannot run out of core");
    assert!(
        matches!(err, PipelineError::Configuration { step: Some(0), .. }),
        "{err}"
    );

    let auto = EngineConfig {
        out_of_core_threshold_bytes: 1,
        ..EngineConfig::default()
    };
    let (backend, _) = run(partition(&registry, &source, &dir.path().join("out")), auto);
    assert_eq!(backend, Backend::Chunked);
}

#[test]
fn test_rerun_after_clearing_output_writes_again() {
    let input = tempfile::tempdir().expect("temp dir");
    let output = tempfile::tempdir().expect("temp dir");
    let out = output.path().join("stores");
    let registry = Registry::with_builtins();
    let source = write(input.path(), "a.csv", "storeId,amount\n1,100\n2,50\n1,30\n");

    for backend in [BackendPreference::InMemory, BackendPreference::Chunked] {
        let pipeline = partition(&registry, &source, &out)
            .config(forced(backend, 2))
            .build()
            .expect("pipeline builds");
        for _ in 0..2 {
            let rows = pipeline
                .execute(&CancellationToken::new())
                .and_then(Execution::drain)
                .expect("pipeline runs");
            assert_eq!(rows, 3);
            assert_eq!(
                std::fs::read_to_string(out.join("1").join("a.csv")).expect("destination exists"),
                "storeId,amount\n1,100\n1,30\n",
                "{backend:?}"
            );
            assert_eq!(
                std::fs::read_to_string(out.join("2").join("a.csv")).expect("destination exists"),
                "storeId,amount\n2,50\n",
                "{backend:?}"
            );
            std::fs::remove_dir_all(&out).expect("clear output");
        }
    }
}

/// Synthetic source of `rows` orders over five stores.
fn synthetic(dir: &Path, rows: usize) -> (PathBuf, BTreeMap<String, f64>) {
    let stores = ["s0", "s1", "s2", "s3", "s4"];
    let mut expected = BTreeMap::new();
    let mut content = String::with_capacity(rows * 12);
    content.push_str("store,amount\n");
    for i in 0..rows {
        let store = stores[(i * 7) % stores.len()];
        let amount = (i * 37) % 2000;
        writeln!(content, "{store},{amount}").expect("write to string");
        if amount > 1000 {
            *expected.entry(store.to_owned()).or_insert(0.0) += amount as f64;
        }
    }
    (write(dir, "synthetic.csv", &content), expected)
}

fn totals(table: &Table) -> BTreeMap<String, f64> {
    table
        .rows()
        .iter()
        .map(|row| {
            (
                row[0].render().into_owned(),
                row[1].as_f64().expect("numeric total"),
            )
        })
        .collect()
}

#[test]
fn test_million_rows_agree_across_backends() {
    let dir = tempfile::tempdir().expect("temp dir");
    let registry = Registry::with_builtins();
    let (source, expected) = synthetic(dir.path(), 1_000_000);
    let sum_by_store = || {
        PipelineBuilder::new(&registry, &source)
            .step_json(
                "filter",
                json!({"predicate": {"binary": {
                    "op": "gt", "left": {"column": "amount"}, "right": {"literal": 1000}
                }}}),
            )
            .step_json(
                "group_by",
                json!({"by": ["store"], "aggregations": [{"column": "amount", "function": "sum"}]}),
            )
    };

    // Auto with a tiny threshold must pick the out-of-core engine.
    let auto = EngineConfig {
        out_of_core_threshold_bytes: 1024,
        ..EngineConfig::default()
    };
    let (backend, out_of_core) = run(sum_by_store(), auto);
    assert_eq!(backend, Backend::OutOfCore);
    let (_, in_memory) = run(sum_by_store(), forced(BackendPreference::InMemory, 50_000));
    let (_, chunked) = run(sum_by_store(), forced(BackendPreference::Chunked, 65_536));

    assert_eq!(totals(&in_memory), expected);
    assert_eq!(totals(&out_of_core), expected);
    assert_eq!(totals(&chunked), expected);
}
