use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::app::App;
use crate::template::{self, Stack};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: &str = "1.0.0";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unable to write {0}: {1}")]
    WriteError(String, #[source] std::io::Error),

    #[error("Unable to remove stale template {0}: {1}")]
    RemoveError(String, #[source] std::io::Error),

    #[error(transparent)]
    Template(#[from] template::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Artifact {
    environment: String,
    template_file: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dependencies: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Manifest {
    version: &'static str,
    artifacts: BTreeMap<String, Artifact>,
}

const TEMPLATE_SUFFIX: &str = ".template.json";

pub fn template_file(stack: &Stack) -> String {
    format!("{}{}", stack.id, TEMPLATE_SUFFIX)
}

/// Writes one template per stack and the manifest into `out_dir`.
///
/// Templates left in `out_dir` by earlier runs for stacks not declared in
/// `app` are removed, so the directory always matches the manifest.
/// Returns the paths written, manifest last.
pub fn write(out_dir: &Path, app: &App) -> Result<Vec<PathBuf>, Error> {
    if let Err(error) = fs::create_dir_all(out_dir) {
        return Err(Error::WriteError(out_dir.display().to_string(), error));
    }
    let current: BTreeSet<String> = app.stacks().map(template_file).collect();
    remove_stale_templates(out_dir, &current)?;

    let mut written = Vec::new();
    let mut artifacts = BTreeMap::new();
    for stack in app.stacks() {
        let file_name = template_file(stack);
        let path = out_dir.join(&file_name);
        write_file(&path, stack.template.to_json()?)?;
        info!(stack = %stack.id, path = %path.display(), "wrote template");
        written.push(path);

        artifacts.insert(
            stack.id.clone(),
            Artifact {
                environment: stack.env.uri(),
                template_file: file_name,
                dependencies: stack.dependencies.clone(),
            },
        );
    }

    let manifest = Manifest {
        version: MANIFEST_VERSION,
        artifacts,
    };
    let contents = match serde_json::to_string_pretty(&manifest) {
        Ok(contents) => contents,
        Err(error) => return Err(Error::SerializationError(error.to_string())),
    };
    let path = out_dir.join(MANIFEST_FILE);
    write_file(&path, contents)?;
    written.push(path);

    return Ok(written);
}

fn remove_stale_templates(out_dir: &Path, current: &BTreeSet<String>) -> Result<(), Error> {
    let entries = match fs::read_dir(out_dir) {
        Ok(entries) => entries,
        Err(error) => return Err(Error::RemoveError(out_dir.display().to_string(), error)),
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if !file_name.ends_with(TEMPLATE_SUFFIX) || current.contains(&file_name) {
            continue;
        }

        let path = entry.path();
        if let Err(error) = fs::remove_file(&path) {
            return Err(Error::RemoveError(path.display().to_string(), error));
        }
        info!(path = %path.display(), "removed stale template");
    }

    return Ok(());
}

fn write_file(path: &Path, contents: String) -> Result<(), Error> {
    match fs::write(path, contents) {
        Ok(_) => Ok(()),
        Err(error) => Err(Error::WriteError(path.display().to_string(), error)),
    }
}
