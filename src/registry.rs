//! Model loading and the read-only registry shared by all request handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use ndarray::Array4;
use tract_onnx::prelude::*;

use crate::config::SourceConfig;
use crate::error::{RegistryError, StartupError};
use crate::preprocess::{ModelKind, TensorLayout};

/// A loaded network that maps one preprocessed batch to per-class scores.
pub trait InferenceModel: Send + Sync {
    /// Runs the forward pass and returns the flattened `1 x C` output.
    fn predict(&self, input: &Array4<f32>) -> anyhow::Result<Vec<f32>>;
}

type OnnxPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// ONNX graph compiled by tract with its input shape pinned.
pub struct TractModel {
    plan: OnnxPlan,
}

impl TractModel {
    pub fn load(path: &Path, layout: TensorLayout) -> anyhow::Result<Self> {
        let plan = tract_onnx::onnx()
            .model_for_path(path)?
            .with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), layout.shape()))?
            .into_optimized()?
            .into_runnable()?;

        Ok(Self { plan })
    }
}

impl InferenceModel for TractModel {
    fn predict(&self, input: &Array4<f32>) -> anyhow::Result<Vec<f32>> {
        let tensor: Tensor = tract_ndarray::Array4::from_shape_vec(
            input.dim(),
            input.iter().copied().collect(),
        )?
        .into_tensor();

        let result = self.plan.run(tvec!(tensor.into()))?;
        let output = result
            .first()
            .ok_or_else(|| anyhow::anyhow!("model returned no outputs"))?;

        Ok(output.to_array_view::<f32>()?.iter().copied().collect())
    }
}

/// Where artifact files are read from.
pub enum ArtifactSource {
    Local { dir: PathBuf },
    Hub { repo: String, api: Api, revision: Option<String> },
}

impl ArtifactSource {
    pub fn from_config(config: &SourceConfig) -> Result<Self, StartupError> {
        match config {
            SourceConfig::Local { dir } => Ok(ArtifactSource::Local { dir: dir.clone() }),
            SourceConfig::Hub {
                repo,
                revision,
                cache_dir,
                token,
            } => {
                let mut builder = ApiBuilder::new();
                if token.is_some() {
                    builder = builder.with_token(token.clone());
                }
                if let Some(dir) = cache_dir {
                    builder = builder.with_cache_dir(dir.clone());
                }
                let api = builder.build().map_err(|source| StartupError::Download {
                    repo: repo.clone(),
                    file: "<client>".to_string(),
                    source,
                })?;

                Ok(ArtifactSource::Hub {
                    repo: repo.clone(),
                    api,
                    revision: revision.clone(),
                })
            }
        }
    }

    /// Resolves `file` to a local path, downloading it first when needed.
    pub fn fetch(&self, file: &str) -> Result<PathBuf, StartupError> {
        match self {
            ArtifactSource::Local { dir } => {
                let path = dir.join(file);
                if !path.is_file() {
                    return Err(StartupError::ArtifactMissing {
                        file: file.to_string(),
                        dir: dir.display().to_string(),
                    });
                }
                Ok(path)
            }
            ArtifactSource::Hub {
                repo,
                api,
                revision,
            } => {
                tracing::info!(repo = %repo, file, "Downloading artifact");
                let handle = match revision {
                    Some(rev) => Repo::with_revision(repo.clone(), RepoType::Model, rev.clone()),
                    None => Repo::model(repo.clone()),
                };
                api.repo(handle)
                    .get(file)
                    .map_err(|source| StartupError::Download {
                        repo: repo.clone(),
                        file: file.to_string(),
                        source,
                    })
            }
        }
    }
}

/// All supported models, loaded up front. Never mutated after construction.
pub struct ModelRegistry {
    models: [(ModelKind, Arc<dyn InferenceModel>); 3],
}

impl ModelRegistry {
    /// Fetches and loads every model, failing on the first one that does not load.
    pub fn load(source: &ArtifactSource, layout: TensorLayout) -> Result<Self, StartupError> {
        let mut loaded: Vec<(ModelKind, Arc<dyn InferenceModel>)> = Vec::new();

        for kind in ModelKind::ALL {
            let file = kind.artifact_file();
            tracing::info!(model = %kind, file = %file, "Loading model");

            let path = source.fetch(&file)?;
            let model = TractModel::load(&path, layout).map_err(|source| StartupError::ModelLoad {
                model: kind.to_string(),
                source,
            })?;

            tracing::info!(model = %kind, "Model loaded successfully");
            loaded.push((kind, Arc::new(model)));
        }

        Self::from_models(loaded)
    }

    /// Builds a registry from already constructed models. Every kind must be present.
    pub fn from_models<I>(models: I) -> Result<Self, StartupError>
    where
        I: IntoIterator<Item = (ModelKind, Arc<dyn InferenceModel>)>,
    {
        let mut slots: [Option<Arc<dyn InferenceModel>>; 3] = [None, None, None];
        for (kind, model) in models {
            slots[kind.index()] = Some(model);
        }

        let [resnet, densenet, mobilenet] = slots;
        let take = |slot: Option<Arc<dyn InferenceModel>>, kind: ModelKind| {
            slot.ok_or_else(|| StartupError::IncompleteRegistry(kind.to_string()))
        };

        Ok(Self {
            models: [
                (ModelKind::Resnet50, take(resnet, ModelKind::Resnet50)?),
                (ModelKind::Densenet169, take(densenet, ModelKind::Densenet169)?),
                (ModelKind::MobilenetV2, take(mobilenet, ModelKind::MobilenetV2)?),
            ],
        })
    }

    pub fn get(&self, id: &str) -> Result<&dyn InferenceModel, RegistryError> {
        let kind: ModelKind = id
            .parse()
            .map_err(|_| RegistryError::NotFound(id.to_string()))?;
        Ok(self.model(kind))
    }

    pub fn model(&self, kind: ModelKind) -> &dyn InferenceModel {
        self.models[kind.index()].1.as_ref()
    }

    /// Kinds held by this registry, in load order.
    pub fn kinds(&self) -> impl Iterator<Item = ModelKind> + '_ {
        self.models.iter().map(|(kind, _)| *kind)
    }
}
