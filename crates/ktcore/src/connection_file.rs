//
// connection_file.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::sync::RwLock;

use serde::Deserialize;
use serde::Serialize;

/// The connection parameters a kernel reads at startup, as listed in the
/// Jupyter specification.
///
/// A control port is always allocated and written even though this transport
/// opens no control socket; kernels refuse connection files without one.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectionInfo {
    pub control_port: u16,
    pub shell_port: u16,
    pub stdin_port: u16,
    pub iopub_port: u16,
    pub hb_port: u16,
    pub transport: String,
    pub signature_scheme: String,
    pub key: String,
    pub ip: String,
}

/// The contents of the connection file; directly parsed from JSON.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectionFile {
    pub info: ConnectionInfo,
}

impl ConnectionFile {
    /// Create a ConnectionFile from a ConnectionInfo struct.
    pub fn from_info(info: ConnectionInfo) -> Self {
        Self { info }
    }

    /// Create a ConnectionFile by parsing the contents of a connection file.
    pub fn from_file<P: AsRef<Path>>(connection_file: P) -> Result<Self, anyhow::Error> {
        let file = File::open(connection_file)?;
        let reader = BufReader::new(file);
        let info = serde_json::from_reader(reader)?;

        Ok(Self { info })
    }

    pub fn to_file<P: AsRef<Path>>(&self, connection_file: P) -> Result<(), anyhow::Error> {
        let file = File::create(connection_file)?;
        serde_json::to_writer_pretty(file, &self.info)?;
        Ok(())
    }

    /// Find a free port that is not in the reserved list.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the port to find. This is used for logging.
    /// * `reserved_ports` - A list of ports that should not be used.
    fn find_port(name: &str, reserved_ports: Arc<RwLock<Vec<u16>>>) -> Result<u16, anyhow::Error> {
        // The number of times we've tried to find an unused, unreserved port
        let mut tries = 0;

        loop {
            // Find a free port
            let candidate = match portpicker::pick_unused_port() {
                Some(port) => port,
                None => {
                    return Err(anyhow::anyhow!(
                        "Failed to pick {} port; no free ports available or port range exhausted",
                        name
                    ));
                }
            };

            // Check if the port is reserved
            {
                let reserved_ports = reserved_ports.read().unwrap();
                if reserved_ports.contains(&candidate) {
                    // Try up to 10 times to find an unreserved port. Since
                    // we're picking from a large range of ports, hitting a
                    // previously reserved port is unlikely, but possible. If
                    // it happens 10 times in a row, something is probably
                    // wrong.
                    tries += 1;
                    if tries > 10 {
                        return Err(anyhow::anyhow!(
                            "Failed to pick unreserved {} port after 10 tries",
                            name
                        ));
                    }
                    log::trace!(
                        "Port {} is reserved; trying again (attempt {})",
                        candidate,
                        tries
                    );
                    continue;
                }
            }

            // Reserve the port
            {
                let mut reserved_ports = reserved_ports.write().unwrap();
                reserved_ports.push(candidate);
                log::trace!(
                    "Picked {} port: {} ({} ports reserved)",
                    name,
                    candidate,
                    reserved_ports.len()
                );
            }

            return Ok(candidate);
        }
    }

    /// Generate a new ConnectionFile by picking free ports and a fresh
    /// signing key.
    ///
    /// # Arguments
    ///
    /// * `ip` - The IP address to bind to
    /// * `reserved_ports` - A list of ports that should not be used. These
    ///   are generally ports that are already in use by other running
    ///   kernels, or have been reserved for use by another kernel that's
    ///   also starting up.
    pub fn generate(
        ip: String,
        reserved_ports: Arc<RwLock<Vec<u16>>>,
    ) -> Result<Self, anyhow::Error> {
        use rand::Rng;

        let key_bytes = rand::thread_rng().gen::<[u8; 16]>();
        let key = hex::encode(key_bytes);

        let control_port = ConnectionFile::find_port("control", reserved_ports.clone())?;
        let shell_port = ConnectionFile::find_port("shell", reserved_ports.clone())?;
        let iopub_port = ConnectionFile::find_port("iopub", reserved_ports.clone())?;
        let hb_port = ConnectionFile::find_port("heartbeat", reserved_ports.clone())?;
        let stdin_port = ConnectionFile::find_port("stdin", reserved_ports.clone())?;
        let info = ConnectionInfo {
            control_port,
            shell_port,
            stdin_port,
            iopub_port,
            hb_port,
            transport: "tcp".to_string(),
            signature_scheme: "hmac-sha256".to_string(),
            key,
            ip,
        };
        Ok(Self { info })
    }

    /// Given a port, return a URI-like string that can be used to connect to
    /// the port, given the other parameters in the connection file.
    ///
    /// Example: `32` => `"tcp://127.0.0.1:32"`
    pub fn endpoint(&self, port: u16) -> String {
        format!("{}://{}:{}", self.info.transport, self.info.ip, port)
    }

    /// All the ports this connection file reserves, for release when the
    /// kernel is destroyed.
    pub fn ports(&self) -> Vec<u16> {
        vec![
            self.info.control_port,
            self.info.shell_port,
            self.info.stdin_port,
            self.info.iopub_port,
            self.info.hb_port,
        ]
    }
}
