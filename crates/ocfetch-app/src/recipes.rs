//! The recipe book.
//!
//! Recipes are YAML files in a directory (one file per recipe id): a
//! loader strategy plus an ordered list of locator strategies, resolved
//! through the strategy registry. `list` enumerates the directory; `load`
//! validates and assembles a runnable [`FetcherRecipe`].
//!
//! ```yaml
//! recipe_id: us-fl
//! loader:
//!   strategy: sftp_loader
//!   params:
//!     meta_load_name: us_fl_sftp_loader
//!     config_name: us-fl
//! locators:
//!   - strategy: sftp_directory_locator
//!     params:
//!       id: us-fl-daily
//!       config_name: us-fl
//!       remote_dir: doc/cor
//!       filename_pattern: "*.txt"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use ocfetch_core::model::{FetcherRecipe, MetaMap};
use ocfetch_core::registry::{StrategyKind, StrategyRegistry};
use serde::Deserialize;

/// A strategy reference in a recipe file.
#[derive(Debug, Deserialize)]
pub struct StrategyRef {
    /// Registered strategy name.
    pub strategy: String,
    /// Parameter object handed to the factory.
    #[serde(default)]
    pub params: MetaMap,
}

/// One recipe file.
#[derive(Debug, Deserialize)]
pub struct RecipeSpec {
    /// Recipe identifier; must match the file stem.
    pub recipe_id: String,
    /// The loader strategy.
    pub loader: StrategyRef,
    /// Ordered locator strategies.
    #[serde(default)]
    pub locators: Vec<StrategyRef>,
}

/// Directory of recipe files.
#[derive(Debug, Clone)]
pub struct RecipeBook {
    dir: PathBuf,
}

impl RecipeBook {
    /// Open the recipe book at `dir`, or at `OC_RECIPES_DIR` (default
    /// `recipes`) when `dir` is `None`.
    #[must_use]
    pub fn new(dir: Option<PathBuf>) -> Self {
        let dir = dir
            .or_else(|| std::env::var("OC_RECIPES_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("recipes"));
        Self { dir }
    }

    /// The book's directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Recipe ids available in the directory, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be read.
    pub fn list(&self) -> anyhow::Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("cannot read recipe directory '{}'", self.dir.display()))?;
        let mut recipes = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if !is_yaml {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                recipes.push(stem.to_owned());
            }
        }
        recipes.sort();
        Ok(recipes)
    }

    fn spec_path(&self, recipe_id: &str) -> anyhow::Result<PathBuf> {
        for ext in ["yaml", "yml"] {
            let path = self.dir.join(format!("{recipe_id}.{ext}"));
            if path.exists() {
                return Ok(path);
            }
        }
        bail!(
            "unknown recipe '{recipe_id}' (no {recipe_id}.yaml under '{}')",
            self.dir.display()
        )
    }

    /// Read and parse a recipe file without resolving strategies.
    ///
    /// # Errors
    ///
    /// Returns an error for a missing file, bad YAML, or a mismatched
    /// `recipe_id`.
    pub fn spec(&self, recipe_id: &str) -> anyhow::Result<RecipeSpec> {
        let path = self.spec_path(recipe_id)?;
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read '{}'", path.display()))?;
        let spec: RecipeSpec = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid recipe file '{}'", path.display()))?;
        if spec.recipe_id != recipe_id {
            bail!(
                "recipe file '{}' declares recipe_id '{}', expected '{recipe_id}'",
                path.display(),
                spec.recipe_id
            );
        }
        Ok(spec)
    }

    /// Assemble a runnable recipe through the registry.
    ///
    /// # Errors
    ///
    /// Returns an error when a strategy is unknown or its parameters are
    /// invalid.
    pub fn load(
        &self,
        recipe_id: &str,
        registry: &StrategyRegistry,
    ) -> anyhow::Result<Arc<FetcherRecipe>> {
        let spec = self.spec(recipe_id)?;

        let loader = registry
            .create(
                StrategyKind::BundleLoader,
                &spec.loader.strategy,
                &spec.loader.params,
            )
            .with_context(|| format!("loader for recipe '{recipe_id}'"))?
            .into_loader(&spec.loader.strategy)?;

        let mut builder = FetcherRecipe::builder(&spec.recipe_id).loader(loader);
        for locator in &spec.locators {
            let instance = registry
                .create(StrategyKind::BundleLocator, &locator.strategy, &locator.params)
                .with_context(|| {
                    format!("locator '{}' for recipe '{recipe_id}'", locator.strategy)
                })?
                .into_locator(&locator.strategy)?;
            builder = builder.locator(instance);
        }
        Ok(Arc::new(builder.build()?))
    }
}

/// Run IDs: `fetcher_<recipe_id>_<yyyymmddhhmmss>`.
#[must_use]
pub fn generate_run_id(recipe_id: &str) -> String {
    let timestamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    format!("fetcher_{recipe_id}_{timestamp}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocfetch_core::filters::register_filter_strategies;
    use ocfetch_http::factories::register_http_strategies;
    use ocfetch_http::manager::HttpManager;

    fn registry() -> StrategyRegistry {
        let mut registry = StrategyRegistry::new();
        register_http_strategies(&mut registry, Arc::new(HttpManager::new()));
        register_filter_strategies(&mut registry);
        registry
    }

    fn book_with(files: &[(&str, &str)]) -> (tempfile::TempDir, RecipeBook) {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        let book = RecipeBook::new(Some(dir.path().to_path_buf()));
        (dir, book)
    }

    const FR_RECIPE: &str = r#"
recipe_id: fr
loader:
  strategy: http_loader
  params:
    meta_load_name: fr_sirene_api_loader
    rate_limit_requests_per_second: 2.0
locators:
  - strategy: pagination_locator
    params:
      id: fr-siren
      base_url: https://mock/siren
      date_start: "2024-01-15"
      date_end: "2024-01-15"
      query_template: "updated:[{date}]"
      narrowing_template: "{narrowing}*"
      narrowing_field: siren
"#;

    #[test]
    fn list_enumerates_yaml_files_sorted() {
        let (_dir, book) = book_with(&[
            ("fr.yaml", FR_RECIPE),
            ("us-fl.yaml", "recipe_id: us-fl\nloader: {strategy: x}\n"),
            ("notes.txt", "not a recipe"),
        ]);
        assert_eq!(book.list().unwrap(), vec!["fr", "us-fl"]);
    }

    #[test]
    fn load_assembles_a_recipe_through_the_registry() {
        let (_dir, book) = book_with(&[("fr.yaml", FR_RECIPE)]);
        let recipe = book.load("fr", &registry()).unwrap();
        assert_eq!(recipe.recipe_id, "fr");
        assert_eq!(recipe.locators.len(), 1);
        assert_eq!(recipe.locators[0].locator_id(), "fr-siren");
    }

    #[test]
    fn unknown_recipe_is_an_error() {
        let (_dir, book) = book_with(&[]);
        let err = book.load("nope", &registry()).unwrap_err();
        assert!(err.to_string().contains("unknown recipe"));
    }

    #[test]
    fn mismatched_recipe_id_is_rejected() {
        let (_dir, book) = book_with(&[(
            "fr.yaml",
            "recipe_id: de\nloader: {strategy: http_loader, params: {meta_load_name: x}}\n",
        )]);
        let err = book.spec("fr").unwrap_err();
        assert!(err.to_string().contains("declares recipe_id"));
    }

    #[test]
    fn invalid_strategy_params_surface_the_field() {
        let (_dir, book) = book_with(&[(
            "fr.yaml",
            r#"
recipe_id: fr
loader:
  strategy: http_loader
  params:
    meta_load_name: x
    bogus_field: 1
"#,
        )]);
        let err = book.load("fr", &registry()).unwrap_err();
        assert!(format!("{err:#}").contains("bogus_field"));
    }

    #[test]
    fn run_id_shape() {
        let run_id = generate_run_id("us-fl");
        assert!(run_id.starts_with("fetcher_us-fl_"));
        let timestamp = run_id.rsplit('_').next().unwrap();
        assert_eq!(timestamp.len(), 14);
        assert!(timestamp.bytes().all(|b| b.is_ascii_digit()));
    }
}
