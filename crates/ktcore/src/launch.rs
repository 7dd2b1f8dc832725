//
// launch.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How to start a kernel, from the Jupyter documentation for
/// [Kernel Specs](https://jupyter-client.readthedocs.io/en/stable/kernels.html#kernel-specs).
///
/// The `{connection_file}` placeholder in `argv` is replaced with the path of
/// the generated connection file at launch.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KernelLaunchSpec {
    /// List of command line arguments to be used to start the kernel
    pub argv: Vec<String>,

    /// The kernel name as it should be displayed in the UI
    pub display_name: String,

    /// The kernel's language
    pub language: String,

    /// Environment variables to set for the kernel
    #[serde(default)]
    pub env: serde_json::Map<String, Value>,

    /// The working directory to start the kernel in, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl KernelLaunchSpec {
    /// Read a kernel spec from a `kernel.json` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let spec = serde_json::from_reader(reader)?;
        Ok(spec)
    }

    /// The argv to run, with the `{connection_file}` placeholder substituted.
    pub fn command_line(&self, connection_file: &str) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| arg.replace("{connection_file}", connection_file))
            .collect()
    }

    /// The environment variables to set, as name/value string pairs.
    /// Non-string JSON values are serialized compactly.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name.clone(), value)
            })
            .collect()
    }
}
