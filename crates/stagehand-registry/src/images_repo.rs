//! Published-image enumeration.
//!
//! Published application images share the backing repository with the
//! record tags. Their tags are the "inert" remainder of the namespace:
//! no record prefix and no valid stage encoding. A named image's tags
//! carry its slugged name as a prefix (`<slugged-name>-<meta-tag>`); the
//! nameless image owns the bare meta tags.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;

use stagehand_core::cancel::checked;
use stagehand_core::error::Result;

use crate::adapter::Registry;
use crate::image::ImageInfo;
use crate::tag;

/// Published-image access over the backing repository.
pub struct ImagesRepo {
    registry: Arc<dyn Registry>,
    parallel: usize,
}

impl ImagesRepo {
    /// Creates the repo view with the given info-fetch fan-out bound.
    #[must_use]
    pub fn new(registry: Arc<dyn Registry>, parallel: usize) -> Self {
        Self {
            registry,
            parallel: parallel.max(1),
        }
    }

    /// The backing repository address.
    #[must_use]
    pub fn repo_address(&self) -> &str {
        self.registry.repo_address()
    }

    /// Encodes the published tag for an image name and meta tag.
    #[must_use]
    pub fn published_tag(image_name: &str, meta_tag: &str) -> String {
        if image_name.is_empty() {
            meta_tag.to_string()
        } else {
            format!("{}-{meta_tag}", tag::slug_image_name(image_name))
        }
    }

    /// Fetches every published image description per image name in scope.
    ///
    /// Tags that vanish between the listing and the info fetch are
    /// skipped. Info fetches run concurrently up to the configured bound.
    ///
    /// # Errors
    ///
    /// Fails on registry errors or caller cancellation.
    pub async fn get_repo_images(
        &self,
        image_names: &[String],
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Vec<ImageInfo>>> {
        let tags = checked(cancel, "list repo tags", self.registry.list_tags()).await?;

        let mut attributed: Vec<(String, String)> = Vec::new();
        for candidate in tags {
            if !is_published_tag(&candidate) {
                continue;
            }
            match attribute_tag(&candidate, image_names) {
                Some(image_name) => attributed.push((image_name, candidate)),
                None => {
                    tracing::debug!(tag = candidate, "skipping tag: no image name in scope");
                }
            }
        }
        attributed.sort();

        let fetched: Vec<(String, Option<ImageInfo>)> = checked(
            cancel,
            "fetch published image infos",
            stream::iter(attributed)
                .map(|(image_name, tag)| {
                    let registry = Arc::clone(&self.registry);
                    async move {
                        registry
                            .try_get_image_info(&tag)
                            .await
                            .map(|info| (image_name, info))
                    }
                })
                .buffer_unordered(self.parallel)
                .try_collect(),
        )
        .await?;

        let mut images: HashMap<String, Vec<ImageInfo>> = HashMap::new();
        for name in image_names {
            images.entry(name.clone()).or_default();
        }
        for (image_name, info) in fetched {
            if let Some(info) = info {
                images.entry(image_name).or_default().push(info);
            }
        }
        for image_list in images.values_mut() {
            image_list.sort_by(|a, b| a.tag.cmp(&b.tag));
        }
        Ok(images)
    }

    /// Deletes one published image.
    ///
    /// Cancellation is only honored before the delete starts; a started
    /// delete runs to completion.
    ///
    /// # Errors
    ///
    /// Fails on registry errors, or with [`Error::Cancelled`] when the
    /// token fired before the delete was issued.
    pub async fn delete_repo_image(
        &self,
        info: &ImageInfo,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(stagehand_core::Error::Cancelled {
                operation: format!("delete published image {}", info.name()),
            });
        }
        self.registry.delete_repo_image(info).await
    }
}

/// Returns whether a tag belongs to the published-image remainder of the
/// namespace.
fn is_published_tag(tag_value: &str) -> bool {
    if tag_value.starts_with(tag::MANAGED_IMAGE_TAG_PREFIX)
        || tag_value.starts_with(tag::IMAGE_METADATA_BY_COMMIT_TAG_PREFIX)
        || tag_value.starts_with(tag::CLIENT_ID_TAG_PREFIX)
    {
        return false;
    }
    tag::decode_stage(tag_value).is_err()
}

/// Attributes a published tag to the longest-matching image name in
/// scope; the nameless image (empty name) claims the remainder.
fn attribute_tag(tag_value: &str, image_names: &[String]) -> Option<String> {
    let mut best: Option<&String> = None;
    for name in image_names {
        if name.is_empty() {
            continue;
        }
        let prefix = format!("{}-", tag::slug_image_name(name));
        if tag_value.starts_with(&prefix)
            && best.map_or(true, |current| name.len() > current.len())
        {
            best = Some(name);
        }
    }
    if let Some(name) = best {
        return Some(name.clone());
    }
    image_names.iter().find(|name| name.is_empty()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRegistry;
    use chrono::Utc;

    #[tokio::test]
    async fn test_published_tags_are_partitioned_per_image() {
        let registry = Arc::new(MemoryRegistry::new("registry.local/demo"));
        let now = Utc::now();
        registry.seed_image("backend-v1", &[], now);
        registry.seed_image("backend-v2", &[], now);
        registry.seed_image("frontend-v1", &[], now);
        registry.seed_image("v9", &[], now);
        registry.seed_image("abc123-1700000000000", &[], now);
        registry.seed_image("managed-image-backend", &[], now);

        let repo = ImagesRepo::new(registry, 4);
        let cancel = CancellationToken::new();
        let scope = vec![
            "backend".to_string(),
            "frontend".to_string(),
            String::new(),
        ];
        let images = repo.get_repo_images(&scope, &cancel).await.expect("images");

        let tags_of = |name: &str| -> Vec<String> {
            images[name].iter().map(|info| info.tag.clone()).collect()
        };
        assert_eq!(tags_of("backend"), vec!["backend-v1", "backend-v2"]);
        assert_eq!(tags_of("frontend"), vec!["frontend-v1"]);
        // Stage and record tags never surface as published images; the
        // remainder goes to the nameless image.
        assert_eq!(tags_of(""), vec!["v9"]);
    }

    #[tokio::test]
    async fn test_out_of_scope_tags_are_skipped() {
        let registry = Arc::new(MemoryRegistry::new("registry.local/demo"));
        registry.seed_image("backend-v1", &[], Utc::now());
        registry.seed_image("orphan-v1", &[], Utc::now());

        let repo = ImagesRepo::new(registry, 4);
        let cancel = CancellationToken::new();
        let images = repo
            .get_repo_images(&["backend".to_string()], &cancel)
            .await
            .expect("images");

        assert_eq!(images.len(), 1);
        assert_eq!(images["backend"].len(), 1);
    }

    #[test]
    fn test_published_tag_encoding() {
        assert_eq!(ImagesRepo::published_tag("", "v1"), "v1");
        assert_eq!(
            ImagesRepo::published_tag("backend/api", "v1"),
            "backend__slash__api-v1"
        );
    }
}
