//! End-to-end tests against a real PostGIS container
//!
//! These tests require Docker to be running. Run with:
//!
//! ```bash
//! cargo test --test pg_e2e -- --ignored --nocapture
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nodelink_etl::config::DbConfig;
use nodelink_etl::descriptor::{
    ColumnKind, ColumnSpec, DatasetDescriptor, GeometrySpec, IndexDescriptor, IndexKind, LoadMode,
    SourceFormat,
};
use nodelink_etl::pipeline::{Pipeline, PipelineOptions};
use nodelink_etl::report::RunState;
use nodelink_etl::store::{PgStore, SpatialStore};
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

const POSTGIS_IMAGE: &str = "postgis/postgis";
const POSTGIS_TAG: &str = "16-3.4";

async fn start_postgis() -> (ContainerAsync<GenericImage>, String) {
    let container = GenericImage::new(POSTGIS_IMAGE, POSTGIS_TAG)
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .start()
        .await
        .expect("Failed to start PostGIS container");

    let host = container.get_host().await.expect("container host");
    let port = container
        .get_host_port_ipv4(5432.tcp())
        .await
        .expect("container port");
    let url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

    // The readiness message fires once for the init restart too, so poll
    // until the server actually accepts connections
    for _ in 0..30 {
        if PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(2))
            .connect(&url)
            .await
            .is_ok()
        {
            return (container, url);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("PostGIS did not become ready");
}

fn node_descriptor(path: &Path) -> DatasetDescriptor {
    DatasetDescriptor {
        name: "moct_node".into(),
        path: path.to_path_buf(),
        encoding: "UTF-8".into(),
        source_srid: 5179,
        target_srid: 4326,
        format: SourceFormat::Delimited {
            delimiter: ',',
            header_rows: 1,
            field_order: None,
        },
        key_column: "node_id".into(),
        columns: vec![
            ColumnSpec {
                field: "NODE_ID".into(),
                column: "node_id".into(),
                kind: ColumnKind::Text,
            },
            ColumnSpec {
                field: "NODE_NAME".into(),
                column: "node_name".into(),
                kind: ColumnKind::Text,
            },
        ],
        geometry: GeometrySpec::PointFields {
            x_field: "X".into(),
            y_field: "Y".into(),
        },
        table: "moct_node".into(),
        batch_size: 2,
        rejection_threshold: 0.01,
        indexes: vec![
            IndexDescriptor {
                columns: vec!["geom".into()],
                kind: IndexKind::Spatial,
            },
            IndexDescriptor {
                columns: vec!["node_id".into()],
                kind: IndexKind::Attribute,
            },
        ],
        bounds: None,
        referential_check: None,
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn loads_reprojects_and_indexes_against_postgis() {
    let (_container, url) = start_postgis().await;

    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("nodes.csv");
    // Seoul City Hall and Yeouido in EPSG:5179 (Korea 2000 Unified CS)
    std::fs::write(
        &csv,
        "NODE_ID,NODE_NAME,X,Y\n\
         N1,seoul_city_hall,953898,1952041\n\
         N2,yeouido,948741,1947945\n\
         N3,gangnam,958204,1944553\n",
    )
    .unwrap();

    let store = Arc::new(
        PgStore::connect(&DbConfig::with_url(&url))
            .await
            .expect("connect"),
    );
    let pipeline = Pipeline::new(Arc::clone(&store));
    let report = pipeline
        .run(
            &[node_descriptor(&csv)],
            &PipelineOptions::new(LoadMode::Overwrite),
        )
        .await;

    let d = &report.datasets[0];
    assert_eq!(d.state, RunState::Succeeded, "error: {:?}", d.error);
    assert_eq!((d.read, d.inserted, d.rejected), (3, 3, 0));

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM moct_node")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 3);

    // Geometry is stored in the target SRID and reprojection landed in Seoul
    let (srid, lon, lat): (i32, f64, f64) = sqlx::query_as(
        "SELECT ST_SRID(geom), ST_X(geom), ST_Y(geom) FROM moct_node WHERE node_id = 'N1'",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(srid, 4326);
    assert!((lon - 126.97).abs() < 0.05, "lon {}", lon);
    assert!((lat - 37.56).abs() < 0.05, "lat {}", lat);

    let indexes: Vec<String> =
        sqlx::query_scalar("SELECT indexname FROM pg_indexes WHERE tablename = 'moct_node'")
            .fetch_all(store.pool())
            .await
            .unwrap();
    assert!(indexes.contains(&"idx_moct_node_geom".to_string()));
    assert!(indexes.contains(&"idx_moct_node_node_id".to_string()));

    // Rerun is idempotent, including index creation
    let rerun = pipeline
        .run(
            &[node_descriptor(&csv)],
            &PipelineOptions::new(LoadMode::Overwrite),
        )
        .await;
    assert!(rerun.succeeded());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn advisory_claims_are_exclusive_across_stores() {
    let (_container, url) = start_postgis().await;

    let first = PgStore::connect(&DbConfig::with_url(&url)).await.unwrap();
    let second = PgStore::connect(&DbConfig::with_url(&url)).await.unwrap();

    first.claim_table("moct_node").await.unwrap();
    let err = second.claim_table("moct_node").await.unwrap_err();
    assert!(err.to_string().contains("claimed"));

    first.release_table("moct_node").await.unwrap();
    second.claim_table("moct_node").await.unwrap();
    second.release_table("moct_node").await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn append_conflicts_leave_the_table_untouched() {
    let (_container, url) = start_postgis().await;

    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("nodes.csv");
    std::fs::write(
        &csv,
        "NODE_ID,NODE_NAME,X,Y\nN1,a,953898,1952041\nN2,b,948741,1947945\n",
    )
    .unwrap();

    let store = Arc::new(
        PgStore::connect(&DbConfig::with_url(&url))
            .await
            .expect("connect"),
    );
    let pipeline = Pipeline::new(Arc::clone(&store));

    let first = pipeline
        .run(
            &[node_descriptor(&csv)],
            &PipelineOptions::new(LoadMode::Overwrite),
        )
        .await;
    assert!(first.succeeded());

    let second = pipeline
        .run(
            &[node_descriptor(&csv)],
            &PipelineOptions::new(LoadMode::Append),
        )
        .await;
    assert_eq!(second.datasets[0].state, RunState::Failed);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM moct_node")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 2);
}
