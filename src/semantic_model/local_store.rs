use crate::semantic_model::{
    Column, CumulativeMetric, JoinType, Manifest, Measure, Metric, Model, Relationship,
    SemanticModelError, SemanticModelStore, TimeGrain, TimeUnit, View, Window,
};
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

/// Manifest store backed by a JSON file on local disk.
#[derive(Clone)]
pub struct LocalSemanticModelStore {
    json_path: Option<PathBuf>,
    manifest: Manifest,
}

impl LocalSemanticModelStore {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SemanticModelError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SemanticModelError::FileNotFound(path.display().to_string()));
        }
        let manifest = Manifest::from_json(&fs::read_to_string(path)?)?;
        debug!(
            "Loaded manifest {}.{} from {}: {} models, {} metrics",
            manifest.catalog,
            manifest.schema,
            path.display(),
            manifest.models.len(),
            manifest.metrics.len()
        );
        Ok(LocalSemanticModelStore {
            json_path: Some(path.to_path_buf()),
            manifest,
        })
    }

    pub fn in_memory(manifest: Manifest) -> Self {
        LocalSemanticModelStore {
            json_path: None,
            manifest,
        }
    }

    /// Music/orders manifest shared by the tests.
    pub fn mock() -> Self {
        let album = Model::new(
            "Album",
            "select * from album",
            vec![
                Column::new("id", "integer").not_null(),
                Column::new("name", "varchar"),
                Column::new("author", "varchar"),
                Column::new("price", "integer"),
                Column::new("bandId", "integer"),
                Column::relationship("band", "Band", "AlbumBand"),
            ],
        )
        .with_primary_key("id");

        let band = Model::new(
            "Band",
            "select * from band",
            vec![
                Column::new("id", "integer").not_null(),
                Column::new("name", "varchar"),
                Column::relationship("albums", "Album", "AlbumBand"),
            ],
        )
        .with_primary_key("id");

        let orders = Model::new(
            "Orders",
            "select * from orders",
            vec![
                Column::new("orderkey", "integer").not_null(),
                Column::new("custkey", "integer"),
                Column::new("status", "varchar").with_expression("orderstatus"),
                Column::new("totalprice", "double"),
                Column::new("orderdate", "date"),
                Column::calculated("discounted", "double", "totalprice * 0.9"),
            ],
        )
        .with_primary_key("orderkey");

        let collection = Metric::new(
            "Collection",
            "Album",
            vec![Column::new("author", "varchar")],
            vec![Column::new("price", "integer").with_expression("sum(Album.price)")],
        );

        let revenue = Metric::new(
            "Revenue",
            "Orders",
            vec![
                Column::new("custkey", "integer"),
                Column::new("orderdate", "date"),
            ],
            vec![Column::new("total", "double").with_expression("sum(totalprice)")],
        )
        .with_time_grain(TimeGrain::new(
            "orderdate",
            "orderdate",
            vec![TimeUnit::Day, TimeUnit::Month, TimeUnit::Year],
        ));

        let weekly_revenue = CumulativeMetric::new(
            "WeeklyRevenue",
            "Orders",
            Measure::new("total", "double", "sum", "totalprice"),
            Window::new("week", "orderdate", TimeUnit::Week),
        );

        LocalSemanticModelStore::in_memory(Manifest {
            catalog: "mdl".to_string(),
            schema: "test".to_string(),
            models: vec![album, band, orders],
            relationships: vec![Relationship::new(
                "AlbumBand",
                ["Album", "Band"],
                JoinType::ManyToOne,
                "Album.bandId = Band.id",
            )],
            metrics: vec![collection, revenue],
            cumulative_metrics: vec![weekly_revenue],
            views: vec![View::new(
                "ZutomayoAlbums",
                "SELECT name, price FROM Album WHERE author = 'ZUTOMAYO'",
            )],
            enum_definitions: vec![],
        })
    }
}

impl SemanticModelStore for LocalSemanticModelStore {
    fn get_manifest(&self) -> Result<Manifest, SemanticModelError> {
        Ok(self.manifest.clone())
    }

    fn save_manifest(&mut self, manifest: Manifest) -> Result<(), SemanticModelError> {
        if let Some(path) = &self.json_path {
            fs::write(path, manifest.to_json()?)?;
            debug!("Saved manifest to {}", path.display());
        }
        self.manifest = manifest;
        Ok(())
    }
}
