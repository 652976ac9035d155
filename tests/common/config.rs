// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fs::{self, File};
use std::io::Write;

use veles::error::Error;

/// A config file written to a temp location for one test run.
pub struct ServerConfig {
    filename: String,
}

impl ServerConfig {
    pub fn new(filename: &str, content: &str) -> Result<Self, Error> {
        if let Some(parent) = std::path::Path::new(filename).parent() {
            fs::create_dir_all(parent)?;
        }
        let mut fd = File::create(filename)?;
        fd.write_all(content.as_bytes())?;
        Ok(Self {
            filename: filename.to_string(),
        })
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }
}

impl Drop for ServerConfig {
    fn drop(&mut self) {
        let _ret = fs::remove_file(&self.filename);
    }
}
