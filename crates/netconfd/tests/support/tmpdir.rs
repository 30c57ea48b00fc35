use std::path::Path;

use anyhow::Context;
use tempfile::TempDir;

pub struct Dir {
    inner: TempDir,
}

impl Dir {
    pub fn new<P: AsRef<Path>>(prefix: P) -> anyhow::Result<Self> {
        let inner = tempfile::Builder::new()
            .prefix(&prefix.as_ref().to_string_lossy().into_owned())
            .tempdir()
            .context("creating tmp dir")?;
        Ok(Dir { inner })
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }
}
