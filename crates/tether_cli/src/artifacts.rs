use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use tether_core::ply::{write_atlas_ply, write_graph_ply, write_path_ply};
use tether_core::Experiment;

/// Output directory for experiment files.
pub struct OutputDir {
    root: PathBuf,
}

impl OutputDir {
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create output directory {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Creates `name` and hands a buffered writer to `body`.
    pub fn write<F>(&self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
    {
        let path = self.root.join(name);
        let file =
            File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        body(&mut writer)
            .and_then(|()| writer.flush())
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!(path = %path.display(), "wrote artifact");
        Ok(())
    }

    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        self.write(name, |w| {
            serde_json::to_writer_pretty(&mut *w, value).map_err(io::Error::from)?;
            writeln!(w)
        })
    }
}

/// `path.ply` (when solved), `atlas.ply` (atlas only) and `graph.ply`.
pub fn write_ply_dumps(out: &OutputDir, experiment: &Experiment) -> Result<()> {
    if !experiment.dense_path().is_empty() {
        out.write("path.ply", |w| write_path_ply(w, experiment.dense_path()))?;
    }
    match experiment.space().and_then(|space| space.as_atlas()) {
        Some(atlas) => out.write("atlas.ply", |w| write_atlas_ply(w, atlas))?,
        None => debug!("projected space has no atlas to dump"),
    }
    if experiment.diagnostics().vertices.is_empty() {
        warn!("planner graph is empty");
    }
    out.write("graph.ply", |w| write_graph_ply(w, experiment.diagnostics()))
}
