//! Image provisioning: local presence check, pull, or recipe build.

use futures::StreamExt;
use gantry_core::error::{Error, Result};
use gantry_core::ports::ContainerApi;
use gantry_events::JobLogger;
use std::path::Path;
use std::sync::Arc;
use tar::Builder;
use walkdir::WalkDir;

/// Ensures job images exist locally before a container is created.
pub struct ImageProvisioner {
    api: Arc<dyn ContainerApi>,
    logger: JobLogger,
}

impl ImageProvisioner {
    pub fn new(api: Arc<dyn ContainerApi>, logger: JobLogger) -> Self {
        Self { api, logger }
    }

    /// Make sure `reference` is available locally, pulling it if absent.
    pub async fn ensure_available(&self, reference: &str) -> Result<()> {
        let images = self.api.image_list().await?;
        let present = images
            .iter()
            .any(|image| image.repo_tags.iter().any(|tag| tag == reference));

        if present {
            self.logger.success("Image is available");
            return Ok(());
        }

        self.logger.info(format!("Image pulling: {}", reference));
        self.logger.info("Waiting for runtime response...");

        let mut progress = self.api.image_pull(reference).await?;
        while let Some(line) = progress.next().await {
            let line = line?;
            if !line.status.is_empty() {
                self.logger
                    .info(format!("{} {}", line.status, line.progress));
            }
        }

        Ok(())
    }

    /// Build an image from a recipe file, tagging the result.
    ///
    /// The recipe's directory becomes the build context; the entry whose
    /// basename matches the recipe file is renamed to `Dockerfile`.
    pub async fn build_from_recipe(&self, recipe_path: &str, tag: &str) -> Result<()> {
        self.logger
            .info(format!("Building image from recipe: {}", recipe_path));

        let context = build_context_tar(Path::new(recipe_path))?;

        let mut output = self.api.image_build(context, tag).await?;
        while let Some(line) = output.next().await {
            let line = line?;
            if let Some(message) = line.error {
                self.logger.error(format!("Build error: {}", message));
                return Err(Error::ImageBuild(message));
            }
            if let Some(stream) = line.stream {
                let trimmed = stream.trim_end_matches('\n');
                if !trimmed.is_empty() {
                    self.logger.info(trimmed);
                }
            }
        }

        self.logger
            .success(format!("Image built successfully: {}", tag));
        Ok(())
    }
}

/// Tar the recipe's directory as a build context, renaming the recipe
/// file itself to `Dockerfile`.
pub fn build_context_tar(recipe_path: &Path) -> Result<Vec<u8>> {
    let context_dir = recipe_path.parent().filter(|p| !p.as_os_str().is_empty());
    let context_dir = context_dir.unwrap_or(Path::new("."));
    let recipe_name = recipe_path
        .file_name()
        .ok_or_else(|| Error::Config(format!("invalid recipe path: {}", recipe_path.display())))?;

    let mut builder = Builder::new(Vec::new());

    for entry in WalkDir::new(context_dir) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(context_dir)
            .map_err(|e| Error::Internal(e.to_string()))?;

        let archive_name = if entry.file_name() == recipe_name {
            Path::new("Dockerfile")
        } else {
            relative
        };

        builder
            .append_path_with_name(entry.path(), archive_name)
            .map_err(|e| Error::Internal(format!("Failed to pack build context: {}", e)))?;
    }

    builder
        .into_inner()
        .map_err(|e| Error::Internal(format!("Failed to finish build context tar: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_build_context_renames_recipe_to_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.dockerfile"), "FROM alpine\n").unwrap();
        fs::write(dir.path().join("entry.sh"), "echo hi\n").unwrap();

        let archive = build_context_tar(&dir.path().join("app.dockerfile")).unwrap();

        let mut names: Vec<String> = tar::Archive::new(archive.as_slice())
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();

        assert_eq!(names, vec!["Dockerfile", "entry.sh"]);
    }
}
