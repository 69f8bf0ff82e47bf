//! File-transfer operations layered on top of the REPL
//!
//! Mirrors `fcopy.py`'s `Fcopy` mixin: `file_size`/`makedirs`/`rm_rf`/`cat`
//! are simple `eval_func` round trips, while `fget`/`fput` interleave a raw
//! byte transfer between submitting the remote program and reading its
//! final response - the `xfer_func` hook in the original. Host-side paths
//! passed here are expected to already be resolved to absolute paths by the
//! caller (`sync.rs`); unlike the original, `host_dir` resolution does not
//! happen twice.

use std::path::Path;

use tracing::debug;

use crate::constants::BUFFER_SIZE;
use crate::error::{IotError, Result};
use crate::mcu_programs;
use crate::repl::{Captured, Session};
use crate::transport::ByteChannel;

const ACK: u8 = 0x06;

/// Bytes outside this allow-list of "safe" control characters mark a file
/// as binary - matches `Fcopy.fput`'s
/// `include = [ord(x) for x in '\a\b\f\n\t\v']` check.
fn looks_binary(data: &[u8]) -> bool {
    const SAFE_CONTROL: [u8; 6] = [7, 8, 12, 10, 9, 11];
    data.iter().any(|&b| b < 32 && !SAFE_CONTROL.contains(&b))
}

impl<'a> Session<'a> {
    /// Size in bytes of `path` on the device, or `-1` if it does not exist.
    pub async fn file_size(&mut self, path: &str) -> Result<i64> {
        let program = mcu_programs::file_size_program(path);
        let raw = self.eval_program(&program).await?;
        raw.parse::<i64>().map_err(|_| IotError::ReplProtocolError {
            detail: format!("file_size: unexpected reply {raw:?}"),
        })
    }

    /// Recursively create `path` and any missing parent directories.
    pub async fn makedirs(&mut self, path: &str) -> Result<bool> {
        let program = mcu_programs::makedirs_program(path);
        let raw = self.eval_program(&program).await?;
        Ok(raw == "True")
    }

    /// `rm -rf path` (non-recursive unless `recursive` is set, matching
    /// the original's default).
    pub async fn rm_rf(&mut self, path: &str, recursive: bool) -> Result<bool> {
        let program = mcu_programs::rm_rf_program(path, recursive);
        let raw = self.eval_program(&program).await?;
        Ok(raw == "True")
    }

    /// Print the device file at `path` to `output`.
    pub async fn cat(&mut self, path: &str, output: &mut dyn crate::repl::Output) -> Result<()> {
        let program = mcu_programs::cat_program(path);
        self.eval(&program, output).await
    }

    /// Upload `local_path` (an absolute host path) to `remote_file` on the
    /// device. Returns `false` (without transferring) if `local_path` is a
    /// directory, matching `Fcopy.fput`'s "copy files only" guard.
    pub async fn fput(&mut self, local_path: &Path, remote_file: &str) -> Result<bool> {
        if local_path.is_dir() {
            return Ok(false);
        }
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| IotError::ReplProtocolError {
                detail: format!("cannot read {}: {e}", local_path.display()),
            })?;
        let binary = looks_binary(&data);
        let filesize = data.len() as u64;

        if let Some(parent) = remote_dirname(remote_file) {
            self.makedirs(parent).await?;
        }

        let program = mcu_programs::mcu_write_program(remote_file, filesize, binary);
        self.exec_part1(&program).await?;
        self.host_to_mcu(&data, binary).await?;
        let mut captured = Captured::default();
        let result = self.exec_part2(&mut captured).await;
        if result.is_ok() {
            self.mark_seen();
        }
        result?;
        let reply = String::from_utf8_lossy(&captured.stdout).trim().to_string();
        Ok(reply == "True")
    }

    /// Download `remote_file` from the device to `local_path` (an
    /// absolute host path). Returns `false` if the remote file is missing.
    pub async fn fget(&mut self, remote_file: &str, local_path: &Path) -> Result<bool> {
        let filesize = self.file_size(remote_file).await?;
        debug!(remote_file, filesize, "fget");
        if filesize < 0 {
            return Ok(false);
        }
        let filesize = filesize as u64;

        let program = mcu_programs::mcu_read_program(remote_file, filesize);
        self.exec_part1(&program).await?;
        let data = self.mcu_to_host(filesize).await?;
        let mut captured = Captured::default();
        let result = self.exec_part2(&mut captured).await;
        if result.is_ok() {
            self.mark_seen();
        }
        result?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| IotError::ReplProtocolError {
                detail: format!("cannot create {}: {e}", parent.display()),
            })?;
        }
        tokio::fs::write(local_path, &data).await.map_err(|e| IotError::ReplProtocolError {
            detail: format!("cannot write {}: {e}", local_path.display()),
        })?;
        Ok(true)
    }

    /// Send `data` to the device in `BUFFER_SIZE`-sized blocks (hex-encoded
    /// if `binary`), waiting for an ACK byte after each. Drives
    /// `_mcu_write` on the device side. Matches `_host_read`.
    async fn host_to_mcu(&mut self, data: &[u8], binary: bool) -> Result<()> {
        let buf_size = if binary { BUFFER_SIZE / 2 } else { BUFFER_SIZE };
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + buf_size).min(data.len());
            let chunk = &data[offset..end];
            if binary {
                let hexed = hex_encode(chunk);
                self.channel().write(hexed.as_bytes()).await?;
            } else {
                self.channel().write(chunk).await?;
            }
            let ack = self.channel().read(1).await?;
            if ack.first() != Some(&ACK) {
                return Err(IotError::ReplProtocolError {
                    detail: format!("expected ACK from device, got {ack:?}"),
                });
            }
            offset = end;
        }
        Ok(())
    }

    /// Receive `filesize` bytes from the device in `BUFFER_SIZE`-sized
    /// blocks, ACKing each. Drives `_mcu_read` on the device side. Matches
    /// `_host_write`.
    async fn mcu_to_host(&mut self, filesize: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(filesize as usize);
        let mut remaining = filesize;
        while remaining > 0 {
            let want = remaining.min(BUFFER_SIZE as u64) as usize;
            let chunk = self.channel().read(want).await?;
            out.extend_from_slice(&chunk);
            self.channel().write(&[ACK]).await?;
            remaining -= want as u64;
        }
        Ok(out)
    }
}

fn remote_dirname(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    if idx == 0 {
        Some("/")
    } else {
        Some(&path[..idx])
    }
}

fn hex_encode(data: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        write!(out, "{b:02x}").expect("writing to a String never fails");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_binary_flags_control_bytes_outside_allow_list() {
        assert!(!looks_binary(b"hello\nworld\t\r"));
        assert!(looks_binary(&[0x00, b'a', b'b']));
    }

    #[test]
    fn hex_encode_matches_binascii_hexlify() {
        assert_eq!(hex_encode(&[0xde, 0xad, 0xbe, 0xef]), "deadbeef");
    }

    #[test]
    fn remote_dirname_handles_root_and_nested() {
        assert_eq!(remote_dirname("/a/b.py"), Some("/a"));
        assert_eq!(remote_dirname("/b.py"), Some("/"));
        assert_eq!(remote_dirname("nofile"), None);
    }
}
