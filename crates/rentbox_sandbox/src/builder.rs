use crate::recipe::{Recipe, recipe};

use rentbox_core::prelude::*;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs;
use tracing::{debug, info, warn};

type BuildFuture = Shared<BoxFuture<'static, Result<BuiltImage, BuildError>>>;
type RemovalFuture = Shared<BoxFuture<'static, Result<(), EngineError>>>;

#[derive(Debug, Clone)]
struct BuiltImage {
    handle: ImageHandle,
    /// The engine already had the tag; nothing was built.
    adopted: bool,
}

enum Slot {
    Ready(ImageHandle),
    Building { generation: u64, build: BuildFuture },
    /// The last holder released an unshared base image and it is being removed.
    Removing { generation: u64, removal: RemovalFuture },
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<ImageKey, Slot>,
    /// Jobs between [`ImageBuilder::base_image`] and [`ImageBuilder::release`], per key.
    holders: HashMap<ImageKey, usize>,
    next_generation: u64,
}

impl CacheState {
    fn generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn hold(&mut self, key: &ImageKey) {
        *self.holders.entry(key.clone()).or_default() += 1;
    }

    /// Returns how many holders remain.
    fn unhold(&mut self, key: &ImageKey) -> usize {
        let Some(count) = self.holders.get_mut(key) else {
            return 0;
        };
        *count = count.saturating_sub(1);
        let remaining = *count;
        if remaining == 0 {
            self.holders.remove(key);
        }
        remaining
    }
}

/// A resolved base image, held until passed to [`ImageBuilder::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImage {
    pub key: ImageKey,
    pub handle: ImageHandle,
    /// No dependency install ran for this request.
    pub reused: bool,
    /// Built for a non-empty dependency set.
    pub has_dependencies: bool,
}

/// What a waiter found in the cache.
enum Lookup {
    Ready(ImageHandle),
    Join {
        build: BuildFuture,
        generation: u64,
        leader: bool,
    },
    AwaitRemoval(RemovalFuture),
}

/// Builds base images (cached per [`ImageKey`]) and per-job images on top of them.
///
/// At most one build per key is in flight; concurrent requests for the same
/// key wait for that build and share its result. With
/// [`remove_unused_bases`](ImageBuilder::remove_unused_bases), a base image with
/// dependencies is removed once its last holder releases it.
#[derive(Clone)]
pub struct ImageBuilder<E: ContainerEngine> {
    engine: E,
    prefix: String,
    work_dir: PathBuf,
    remove_unused: bool,
    cache: Arc<Mutex<CacheState>>,
}

impl<E: ContainerEngine> ImageBuilder<E> {
    pub fn new(engine: E, prefix: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            prefix: prefix.into(),
            work_dir: work_dir.into(),
            remove_unused: false,
            cache: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    /// Remove base images with dependencies when no job holds them any more.
    /// Dependency-free bases are always kept.
    pub fn remove_unused_bases(mut self, remove: bool) -> Self {
        self.remove_unused = remove;
        self
    }

    /// Resolves the base image for `language` + `dependencies`, building it if needed.
    ///
    /// The caller holds the image until it calls [`release`](Self::release).
    pub async fn base_image(
        &self,
        language: Language,
        dependencies: &[String],
    ) -> Result<BaseImage, BuildError> {
        let recipe = recipe(language);
        recipe.validate_dependencies(dependencies)?;

        let key = ImageKey::new(language, dependencies);
        let has_dependencies = !normalize_dependencies(dependencies).is_empty();

        loop {
            let lookup = self.lookup(&key, || {
                build_base(
                    self.engine.clone(),
                    recipe,
                    key.tag(&self.prefix),
                    normalize_dependencies(dependencies),
                    self.work_dir
                        .join(format!("base-{}", uuid::Uuid::new_v4().simple())),
                )
                .boxed()
                .shared()
            });

            let (build, generation, leader) = match lookup {
                Lookup::Ready(handle) => {
                    return Ok(BaseImage {
                        key,
                        handle,
                        reused: true,
                        has_dependencies,
                    });
                }
                Lookup::AwaitRemoval(removal) => {
                    debug!(key = %key, "waiting for base image removal");
                    let _ = removal.await;
                    continue;
                }
                Lookup::Join {
                    build,
                    generation,
                    leader,
                } => (build, generation, leader),
            };

            let result = build.await;

            {
                let mut state = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
                let current = matches!(
                    state.slots.get(&key),
                    Some(Slot::Building { generation: g, .. }) if *g == generation
                );
                match &result {
                    Ok(built) if current => {
                        state
                            .slots
                            .insert(key.clone(), Slot::Ready(built.handle.clone()));
                    }
                    Ok(_) => {}
                    Err(_) => {
                        if current {
                            state.slots.remove(&key);
                        }
                        state.unhold(&key);
                    }
                }
            }

            let built = result?;
            return Ok(BaseImage {
                key,
                handle: built.handle,
                reused: !leader || built.adopted,
                has_dependencies,
            });
        }
    }

    /// Looks `key` up and takes a hold on it unless it is being removed.
    /// Starts `start_build` when nothing is cached.
    fn lookup(&self, key: &ImageKey, start_build: impl FnOnce() -> BuildFuture) -> Lookup {
        let mut state = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let lookup = match state.slots.get(key) {
            Some(Slot::Ready(handle)) => {
                debug!(key = %key, image = %handle.tag, "base image cache hit");
                Lookup::Ready(handle.clone())
            }
            Some(Slot::Removing { removal, .. }) => return Lookup::AwaitRemoval(removal.clone()),
            Some(Slot::Building { generation, build }) => {
                debug!(key = %key, "waiting for in-flight base image build");
                Lookup::Join {
                    build: build.clone(),
                    generation: *generation,
                    leader: false,
                }
            }
            None => {
                let generation = state.generation();
                let build = start_build();
                state.slots.insert(
                    key.clone(),
                    Slot::Building {
                        generation,
                        build: build.clone(),
                    },
                );
                Lookup::Join {
                    build,
                    generation,
                    leader: true,
                }
            }
        };
        state.hold(key);
        lookup
    }

    /// Gives up a hold taken by [`base_image`](Self::base_image).
    ///
    /// Removes the image from the engine when it was the last hold, unused base
    /// removal is on and the image has dependencies. An image the engine no
    /// longer has counts as removed.
    pub async fn release(&self, base: &BaseImage) -> Result<(), EngineError> {
        let (generation, removal) = {
            let mut state = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if state.unhold(&base.key) > 0 || !self.remove_unused || !base.has_dependencies {
                return Ok(());
            }
            let ready = matches!(
                state.slots.get(&base.key),
                Some(Slot::Ready(handle)) if handle.tag == base.handle.tag
            );
            if !ready {
                return Ok(());
            }

            let generation = state.generation();
            let engine = self.engine.clone();
            let tag = base.handle.tag.clone();
            let removal = async move {
                match engine.remove_image(&tag).await {
                    Err(EngineError::NotFound(_)) => Ok(()),
                    other => other,
                }
            }
            .boxed()
            .shared();
            state.slots.insert(
                base.key.clone(),
                Slot::Removing {
                    generation,
                    removal: removal.clone(),
                },
            );
            (generation, removal)
        };

        info!(image = %base.handle.tag, "removing unused base image");
        let result = removal.await;

        let mut state = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(
            state.slots.get(&base.key),
            Some(Slot::Removing { generation: g, .. }) if *g == generation
        ) {
            state.slots.remove(&base.key);
        }
        result
    }

    /// Builds the ephemeral image holding `job`'s source, in `context_dir`.
    pub async fn job_image(
        &self,
        job: &Job,
        base: &ImageHandle,
        context_dir: &Path,
    ) -> Result<ImageHandle, BuildError> {
        let recipe = recipe(job.language);
        let tag = job_image_tag(&self.prefix, &job.id);

        fs::create_dir_all(context_dir).await?;
        fs::write(context_dir.join(recipe.source_file), job.source_code()).await?;
        fs::write(
            context_dir.join("Dockerfile"),
            recipe.job_dockerfile(&base.tag),
        )
        .await?;

        let mut image_labels = managed_labels(ImageKind::Job);
        image_labels.insert(labels::JOB.to_string(), job.id.clone());

        debug!(job_id = %job.id, image = %tag, source_bytes = job.source_code().len(), "building job image");
        self.engine
            .build_image(BuildContext {
                tag: tag.clone(),
                dir: context_dir.to_path_buf(),
                labels: image_labels,
            })
            .await?;

        Ok(ImageHandle {
            tag,
            kind: ImageKind::Job,
        })
    }

    /// Drops the ready entry for an image that was removed from the engine.
    pub fn forget_tag(&self, tag: &str) {
        let mut state = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .slots
            .retain(|_, slot| !matches!(slot, Slot::Ready(handle) if handle.tag == tag));
    }

    /// Tags of base images currently marked ready.
    pub fn cached_tags(&self) -> Vec<String> {
        let state = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(handle) => Some(handle.tag.clone()),
                Slot::Building { .. } | Slot::Removing { .. } => None,
            })
            .collect()
    }
}

pub(crate) fn managed_labels(kind: ImageKind) -> HashMap<String, String> {
    HashMap::from([
        (labels::MANAGED.to_string(), "true".to_string()),
        (labels::KIND.to_string(), kind.as_str().to_string()),
    ])
}

async fn build_base<E: ContainerEngine>(
    engine: E,
    recipe: &'static Recipe,
    tag: String,
    dependencies: Vec<String>,
    context_dir: PathBuf,
) -> Result<BuiltImage, BuildError> {
    let handle = ImageHandle {
        tag: tag.clone(),
        kind: ImageKind::Base,
    };

    if engine.image_exists(&tag).await? {
        info!(image = %tag, "adopting existing base image");
        return Ok(BuiltImage {
            handle,
            adopted: true,
        });
    }

    fs::create_dir_all(&context_dir).await?;
    let result = async {
        fs::write(
            context_dir.join("Dockerfile"),
            recipe.base_dockerfile(&dependencies),
        )
        .await?;

        info!(
            image = %tag,
            language = %recipe.language,
            dependencies = dependencies.len(),
            "building base image"
        );

        engine
            .build_image(BuildContext {
                tag: tag.clone(),
                dir: context_dir.clone(),
                labels: managed_labels(ImageKind::Base),
            })
            .await
            .map_err(|err| match err {
                EngineError::BuildFailed(msg) if !dependencies.is_empty() => {
                    BuildError::DependencyResolution(msg)
                }
                other => BuildError::from(other),
            })
    }
    .await;

    if let Err(e) = fs::remove_dir_all(&context_dir).await {
        warn!(path = %context_dir.display(), "failed to remove base build context: {e}");
    }

    result.map(|_| BuiltImage {
        handle,
        adopted: false,
    })
}
