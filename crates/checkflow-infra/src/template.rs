//! Template loading from a directory of YAML or JSON files.
//!
//! `{dir}/{template_id}.yaml`, `.yml` and `.json` are tried in that order.
//! The file's own `id` must match the requested id.

use std::path::{Path, PathBuf};

use checkflow_core::state::TemplateSource;
use checkflow_types::error::WorkflowError;
use checkflow_types::template::ChecklistTemplate;

use crate::filesystem::check_file_stem;

const EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// `TemplateSource` reading checklist files from one directory.
#[derive(Debug, Clone)]
pub struct FileTemplateSource {
    dir: PathBuf,
}

impl FileTemplateSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ids of every template file in the directory, sorted.
    pub async fn list_templates(&self) -> Result<Vec<String>, std::io::Error> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let known = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| EXTENSIONS.contains(&e));
            if !known {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn find(&self, template_id: &str) -> Result<Option<(PathBuf, String)>, std::io::Error> {
        for extension in EXTENSIONS {
            let path = self.dir.join(format!("{template_id}.{extension}"));
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => return Ok(Some((path, content))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

/// Parse template text by file extension.
pub fn parse_template(path: &Path, content: &str) -> Result<ChecklistTemplate, String> {
    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    if is_json {
        serde_json::from_str(content).map_err(|e| format!("invalid JSON: {e}"))
    } else {
        serde_yaml_ng::from_str(content).map_err(|e| format!("invalid YAML: {e}"))
    }
}

impl TemplateSource for FileTemplateSource {
    async fn load_template(&self, template_id: &str) -> Result<ChecklistTemplate, WorkflowError> {
        let load_error = |reason: String| WorkflowError::TemplateLoad {
            template_id: template_id.to_string(),
            reason,
        };

        check_file_stem(template_id).map_err(load_error)?;
        let (path, content) = self
            .find(template_id)
            .await
            .map_err(|e| load_error(format!("failed to read template: {e}")))?
            .ok_or_else(|| {
                load_error(format!("template not found in {}", self.dir.display()))
            })?;

        let template = parse_template(&path, &content).map_err(load_error)?;
        if template.id != template_id {
            return Err(load_error(format!(
                "{} declares id '{}'",
                path.display(),
                template.id
            )));
        }
        template.validate().map_err(load_error)?;

        tracing::debug!(
            template_id,
            path = %path.display(),
            steps = template.steps.len(),
            "template loaded"
        );
        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkflow_types::template::ValidationType;
    use tempfile::TempDir;

    const RELEASE_YAML: &str = r#"
id: release
name: Release checklist
version: "1.0"
variables:
  env: staging
steps:
  - id: build
    title: Build artifacts
    validation:
      - type: command
        check: cargo build --release
        errorMessage: Build must pass
  - id: deploy
    title: Deploy
    condition: '${env} === "prod"'
"#;

    async fn write(dir: &TempDir, name: &str, content: &str) {
        tokio::fs::write(dir.path().join(name), content).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_yaml() {
        let dir = TempDir::new().unwrap();
        write(&dir, "release.yaml", RELEASE_YAML).await;
        let source = FileTemplateSource::new(dir.path());

        let template = source.load_template("release").await.unwrap();

        assert_eq!(template.name, "Release checklist");
        assert_eq!(template.steps.len(), 2);
        let validation = &template.steps[0].validation.as_ref().unwrap()[0];
        assert_eq!(validation.validation_type, ValidationType::Command);
        assert_eq!(validation.error_message.as_deref(), Some("Build must pass"));
        assert_eq!(
            template.steps[1].condition.as_deref(),
            Some("${env} === \"prod\"")
        );
    }

    #[tokio::test]
    async fn test_load_json() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "onboard.json",
            r#"{"id":"onboard","name":"Onboarding","steps":[{"id":"a","title":"A"}]}"#,
        )
        .await;
        let source = FileTemplateSource::new(dir.path());

        let template = source.load_template("onboard").await.unwrap();
        assert_eq!(template.steps[0].id, "a");
    }

    #[tokio::test]
    async fn test_missing_template() {
        let dir = TempDir::new().unwrap();
        let source = FileTemplateSource::new(dir.path());
        let err = source.load_template("nope").await.unwrap_err();
        assert!(matches!(err, WorkflowError::TemplateLoad { .. }));
    }

    #[tokio::test]
    async fn test_invalid_templates_are_rejected() {
        let dir = TempDir::new().unwrap();
        write(&dir, "broken.yml", "id: broken\nsteps: [ unclosed").await;
        write(
            &dir,
            "dup.yaml",
            "id: dup\nname: Dup\nsteps:\n  - {id: a, title: A}\n  - {id: a, title: B}\n",
        )
        .await;
        write(&dir, "alias.yaml", "id: other\nname: Other\nsteps: []\n").await;
        let source = FileTemplateSource::new(dir.path());

        for id in ["broken", "dup", "alias", "../etc"] {
            let err = source.load_template(id).await.unwrap_err();
            assert!(
                matches!(err, WorkflowError::TemplateLoad { .. }),
                "{id}: {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_list_templates() {
        let dir = TempDir::new().unwrap();
        write(&dir, "release.yaml", RELEASE_YAML).await;
        write(&dir, "onboard.json", "{}").await;
        write(&dir, "notes.txt", "ignored").await;
        let source = FileTemplateSource::new(dir.path());

        assert_eq!(source.list_templates().await.unwrap(), vec!["onboard", "release"]);
        let missing = FileTemplateSource::new(dir.path().join("missing"));
        assert!(missing.list_templates().await.unwrap().is_empty());
    }
}
