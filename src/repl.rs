//! The raw-REPL wire protocol and the `Session` facade built on top of it
//!
//! Mirrors `repl.py`: enter raw REPL mode with Ctrl-A, submit source with
//! Ctrl-D, and read back the two-`EOT`-delimited response
//! (`<stdout>\x04<stderr>\x04>`). `Session` is the typed equivalent of the
//! Python `Device` object once it has been used as a context manager - the
//! same struct is extended with file-transfer methods in `fcopy.rs` and
//! directory-sync methods in `sync.rs`, mirroring the mixin chain
//! `Device -> Repl -> Fcopy -> Rsync` (spec §9 "Session as a capability
//! stack").

use std::time::Duration;

use tracing::debug;

use crate::constants::{
    DEFAULT_CLOCK_SYNC_TOLERANCE_SECS, DEFAULT_READ_UNTIL_TIMEOUT_SECS, MCU_ABORT, MCU_EOT,
    MCU_RAW_REPL, RAW_REPL_BANNER,
};
use crate::device::DeviceSession;
use crate::error::{IotError, Result};
use crate::mcu_programs;

/// Where the output of an `eval` goes. The REPL never decides how to
/// render output - the caller supplies a sink (mirrors `Repl.eval`'s
/// optional `out`/`err` callback args).
pub trait Output: Send {
    /// A chunk of the device's stdout.
    fn ans(&mut self, data: &[u8]);
    /// A chunk of the device's stderr (a MicroPython traceback, usually).
    fn err(&mut self, data: &[u8]);
}

/// An `Output` that just accumulates both streams, for callers that only
/// want the final strings (most `eval_func`-based operations).
#[derive(Default)]
pub struct Captured {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Output for Captured {
    fn ans(&mut self, data: &[u8]) {
        self.stdout.extend_from_slice(data);
    }
    fn err(&mut self, data: &[u8]) {
        self.stderr.extend_from_slice(data);
    }
}

/// The device RTC reading returned by `get_time`, shaped like Python's
/// `time.struct_time` (but 0-based weekday/yearday fixed up to match the
/// host's `time.localtime()` convention is left to the caller).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McuTime {
    pub year: i32,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub weekday: u8,
    pub yearday: u16,
}

/// Feature flags reported by `device_characteristics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCharacteristics {
    pub has_buffer: bool,
    pub has_binascii: bool,
    pub time_offset: i64,
}

/// A borrowed, exclusively-locked device session with the REPL protocol
/// layered on top. `fcopy.rs` and `sync.rs` add further `impl` blocks for
/// this same type.
pub struct Session<'a> {
    session: &'a mut DeviceSession,
}

impl<'a> Session<'a> {
    pub fn new(session: &'a mut DeviceSession) -> Self {
        Self { session }
    }

    pub fn uid(&self) -> &str {
        self.session.uid()
    }

    pub(crate) fn channel(&mut self) -> &mut dyn crate::transport::ByteChannel {
        self.session.channel()
    }

    pub(crate) fn mark_seen(&self) {
        self.session.device().mark_seen();
    }

    /// Interrupt whatever is running, enter raw REPL mode, paste `source`,
    /// and submit it with Ctrl-D; returns once the device has echoed back
    /// `OK` acknowledging the paste. Matches `Repl.__exec_part_1`.
    ///
    /// Exposed at `pub(crate)` so `fcopy.rs` can interleave a raw
    /// byte-transfer between submitting a program and reading its final
    /// response (`eval_func`'s `xfer_func` hook).
    pub(crate) async fn exec_part1(&mut self, source: &str) -> Result<()> {
        let deadline = Duration::from_secs(DEFAULT_READ_UNTIL_TIMEOUT_SECS);
        self.channel().write(&[MCU_ABORT, MCU_ABORT]).await?;
        self.channel().write(&[MCU_RAW_REPL]).await?;
        self.channel().read_until(RAW_REPL_BANNER, deadline).await?;
        self.channel().write(source.as_bytes()).await?;
        self.channel().write(&[b'\r', MCU_EOT]).await?;
        let ack = self.channel().read(2).await?;
        if ack.as_ref() != b"OK" {
            return Err(IotError::ReplProtocolError {
                detail: format!("device did not acknowledge source with OK, got {ack:?}"),
            });
        }
        Ok(())
    }

    /// Read the `<stdout>\x04<stderr>\x04>` response that follows a
    /// submitted program, delivering each half to `output` as it arrives
    /// rather than buffering the whole reply first - a program that prints
    /// progressively (or a large `cat`) streams through `output.ans` as
    /// each `read_all` returns, same as `Repl.__exec_part_2`'s own
    /// `out(ans[0])` call inside its read loop. The split between stdout
    /// and stderr is tracked across reads since either `MCU_EOT` marker may
    /// land anywhere within a chunk, including mid-chunk or split across
    /// two chunks.
    pub(crate) async fn exec_part2(&mut self, output: &mut dyn Output) -> Result<()> {
        #[derive(PartialEq, Eq)]
        enum Phase {
            Stdout,
            Stderr,
            Done,
        }

        let mut phase = Phase::Stdout;
        let mut stderr_acc = Vec::new();
        let start = std::time::Instant::now();
        let overall_timeout = Duration::from_secs(DEFAULT_READ_UNTIL_TIMEOUT_SECS * 6);
        loop {
            let chunk = self.channel().read_all().await?;
            if chunk.is_empty() {
                if start.elapsed() > overall_timeout {
                    return Err(IotError::Timeout { waited: overall_timeout });
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            }

            let mut rest = &chunk[..];
            while !rest.is_empty() && phase != Phase::Done {
                match phase {
                    Phase::Stdout => {
                        if let Some(pos) = rest.iter().position(|&b| b == MCU_EOT) {
                            output.ans(&rest[..pos]);
                            rest = &rest[pos + 1..];
                            phase = Phase::Stderr;
                        } else {
                            output.ans(rest);
                            rest = &[];
                        }
                    }
                    Phase::Stderr => {
                        if let Some(pos) = rest.iter().position(|&b| b == MCU_EOT) {
                            let piece = &rest[..pos];
                            stderr_acc.extend_from_slice(piece);
                            if !piece.is_empty() {
                                output.err(piece);
                            }
                            rest = &[];
                            phase = Phase::Done;
                        } else {
                            stderr_acc.extend_from_slice(rest);
                            if !rest.is_empty() {
                                output.err(rest);
                            }
                            rest = &[];
                        }
                    }
                    Phase::Done => break,
                }
            }
            if phase == Phase::Done {
                break;
            }
        }

        if stderr_acc.is_empty() {
            Ok(())
        } else {
            Err(IotError::ReplExecutionError {
                traceback: String::from_utf8_lossy(&stderr_acc).into_owned(),
            })
        }
    }

    /// Evaluate raw MicroPython source on the device, reporting stdout/
    /// stderr to `output`. Equivalent to `Repl.eval`.
    pub async fn eval(&mut self, source: &str, output: &mut dyn Output) -> Result<()> {
        self.exec_part1(source).await?;
        let result = self.exec_part2(output).await;
        if result.is_ok() {
            self.mark_seen();
        }
        result
    }

    /// Evaluate a pre-authored remote program (spec §9 "Dynamic code
    /// shipping") and return its captured stdout as a UTF-8 string,
    /// trimmed of the trailing newline `print` appends.
    pub(crate) async fn eval_program(&mut self, program: &str) -> Result<String> {
        let mut captured = Captured::default();
        self.eval(program, &mut captured).await?;
        Ok(String::from_utf8_lossy(&captured.stdout).trim_end().to_string())
    }

    /// Interrupt whatever is running and soft-reset the MicroPython VM,
    /// then wait for it to re-enter raw REPL. Matches `Repl.softreset`.
    pub async fn softreset(&mut self) -> Result<()> {
        self.channel().write(&[MCU_ABORT]).await?;
        self.channel().write(&[MCU_EOT]).await?;
        self.channel().write(b"\n").await?;
        self.channel()
            .read_until(RAW_REPL_BANNER, Duration::from_secs(DEFAULT_READ_UNTIL_TIMEOUT_SECS))
            .await?;
        self.mark_seen();
        Ok(())
    }

    /// Read the device's silicon/chip UID, formatted as colon-separated
    /// hex. Used once at discovery time to learn a serial device's stable
    /// identity (`discover_serial.py`'s `_uid` call).
    pub async fn read_uid(&mut self) -> Result<String> {
        let program = mcu_programs::uid_program();
        let uid = self.eval_program(&program).await?;
        if uid.is_empty() || uid == "None" {
            return Err(IotError::ReplProtocolError {
                detail: "device reported no unique id".into(),
            });
        }
        Ok(uid)
    }

    /// Read the device's RTC.
    pub async fn get_time(&mut self) -> Result<McuTime> {
        let program = mcu_programs::get_time_program();
        let raw = self.eval_program(&program).await?;
        parse_struct_time(&raw)
    }

    /// Synchronize the device RTC to the host clock if skew exceeds
    /// `tolerance`. `host_local_time` is a 9-tuple rendered the way
    /// `time.localtime()` would print it, e.g. `(2026, 7, 28, 10, 5, 0, 1,
    /// 209, 0)`.
    pub async fn sync_time(&mut self, host_local_time: [i64; 9], tolerance: Duration) -> Result<()> {
        let tuple = format!(
            "({}, {}, {}, {}, {}, {}, {}, {}, {})",
            host_local_time[0],
            host_local_time[1],
            host_local_time[2],
            host_local_time[3],
            host_local_time[4],
            host_local_time[5],
            host_local_time[6],
            host_local_time[7],
            host_local_time[8],
        );
        let program =
            mcu_programs::set_time_program(&tuple, tolerance.as_secs() as i64);
        self.eval_program(&program).await?;
        Ok(())
    }

    /// Default-tolerance convenience wrapper over `sync_time`.
    pub async fn sync_time_default(&mut self, host_local_time: [i64; 9]) -> Result<()> {
        self.sync_time(
            host_local_time,
            Duration::from_secs(DEFAULT_CLOCK_SYNC_TOLERANCE_SECS as u64),
        )
        .await
    }

    /// Query feature flags used to adapt file-transfer strategy.
    pub async fn device_characteristics(&mut self) -> Result<DeviceCharacteristics> {
        let program = mcu_programs::device_characteristics_program();
        let raw = self.eval_program(&program).await?;
        parse_characteristics(&raw)
    }
}

/// Parse a Python `tuple(time.localtime())` repr like
/// `(2026, 7, 28, 10, 5, 0, 1, 209, 0)`.
fn parse_struct_time(raw: &str) -> Result<McuTime> {
    let nums = parse_int_tuple(raw, 9)?;
    Ok(McuTime {
        year: nums[0] as i32,
        month: nums[1] as u8,
        day: nums[2] as u8,
        hour: nums[3] as u8,
        minute: nums[4] as u8,
        second: nums[5] as u8,
        weekday: nums[6] as u8,
        yearday: nums[7] as u16,
    })
}

fn parse_int_tuple(raw: &str, expected: usize) -> Result<Vec<i64>> {
    let trimmed = raw.trim().trim_start_matches('(').trim_end_matches(')');
    let nums: std::result::Result<Vec<i64>, _> =
        trimmed.split(',').map(|s| s.trim().parse::<i64>()).collect();
    let nums = nums.map_err(|e| IotError::ReplProtocolError {
        detail: format!("malformed tuple from device: {raw:?} ({e})"),
    })?;
    if nums.len() < expected {
        return Err(IotError::ReplProtocolError {
            detail: format!("expected {expected} fields, got {}: {raw:?}", nums.len()),
        });
    }
    Ok(nums)
}

/// Parse the Python dict repr produced by `device_characteristics_program`,
/// e.g. `{'has_buffer': True, 'has_binascii': False, 'time_offset': 0}`.
fn parse_characteristics(raw: &str) -> Result<DeviceCharacteristics> {
    let has_buffer = raw.contains("'has_buffer': True");
    let has_binascii = raw.contains("'has_binascii': True");
    let time_offset = raw
        .rsplit("'time_offset':")
        .next()
        .and_then(|rest| rest.trim().trim_end_matches('}').trim().parse::<i64>().ok())
        .unwrap_or(0);
    debug!(has_buffer, has_binascii, time_offset, "device characteristics");
    Ok(DeviceCharacteristics { has_buffer, has_binascii, time_offset })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_struct_time_reads_fields_in_order() {
        let t = parse_struct_time("(2026, 7, 28, 10, 5, 0, 1, 209, 0)").unwrap();
        assert_eq!(t.year, 2026);
        assert_eq!(t.month, 7);
        assert_eq!(t.day, 28);
        assert_eq!(t.weekday, 1);
        assert_eq!(t.yearday, 209);
    }

    #[test]
    fn parse_struct_time_rejects_short_tuple() {
        assert!(parse_struct_time("(1, 2, 3)").is_err());
    }

    #[test]
    fn parse_characteristics_reads_flags_and_offset() {
        let c = parse_characteristics(
            "{'has_buffer': True, 'has_binascii': False, 'time_offset': 946684800}",
        )
        .unwrap();
        assert!(c.has_buffer);
        assert!(!c.has_binascii);
        assert_eq!(c.time_offset, 946684800);
    }

    #[tokio::test]
    async fn eval_round_trips_stdout_through_scripted_channel() {
        use crate::device::Device;
        use crate::test_support::ScriptedChannel;
        use std::sync::Arc;

        // raw-repl banner, then OK ack, then "hi\x04\x04>" response.
        let mut inbound = RAW_REPL_BANNER.to_vec();
        inbound.extend_from_slice(b"OK");
        inbound.extend_from_slice(b"hi\x04\x04>");
        let channel = ScriptedChannel::new(inbound);
        let device =
            Arc::new(Device::new("aa:bb".into(), "test".into(), Box::new(channel)));
        let mut dsession = device.acquire().await;
        let mut session = Session::new(&mut dsession);
        let mut captured = Captured::default();
        session.eval("print('hi')", &mut captured).await.unwrap();
        assert_eq!(captured.stdout, b"hi");
        assert!(captured.stderr.is_empty());
    }
}
