//! Per-connection state machine and packet dispatch (§4.8). One `Session`
//! serves exactly one client to completion, then the owning `GdbServer`
//! accepts the next.

use crate::protocol::{self, Event};
use crate::transport;
use labwired_core::debug::DebugTarget;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

const VENDOR: &str = "labwired";
const SIGTRAP: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    PreConnect,
    Handshake,
    Running,
    Shutdown,
    FatalError,
}

pub struct Session {
    stream: TcpStream,
    target: Arc<Mutex<dyn DebugTarget>>,
    shutdown: Arc<AtomicBool>,
    state: ConnState,
    no_ack: bool,
    pending: Vec<u8>,
    step_rx: mpsc::Receiver<()>,
    step_tx: mpsc::Sender<()>,
}

impl Session {
    pub fn new(
        stream: TcpStream,
        target: Arc<Mutex<dyn DebugTarget>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let (step_tx, step_rx) = mpsc::channel();
        Self {
            stream,
            target,
            shutdown,
            state: ConnState::PreConnect,
            no_ack: false,
            pending: Vec::new(),
            step_rx,
            step_tx,
        }
    }

    /// Serves this connection until the client disconnects, the server is
    /// asked to shut down, or a malformed packet forces `FatalError`.
    pub fn run(&mut self) {
        while !self.shutdown.load(Ordering::Acquire) {
            if self.step_rx.try_recv().is_ok() {
                self.emit_signal(SIGTRAP, StopReason::Plain);
            }

            match transport::read_all(&mut self.stream) {
                Ok(None) => {
                    tracing::debug!("debug client disconnected");
                    self.state = ConnState::Shutdown;
                    return;
                }
                Ok(Some(bytes)) if !bytes.is_empty() => self.pending.extend_from_slice(&bytes),
                Ok(Some(_)) => continue,
                Err(e) => {
                    tracing::debug!("debug socket read error: {e}");
                    self.state = ConnState::Shutdown;
                    return;
                }
            }

            loop {
                match protocol::take_event(&mut self.pending) {
                    Ok(Some(event)) => {
                        self.handle_event(event);
                        if matches!(self.state, ConnState::Shutdown | ConnState::FatalError) {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("malformed debug packet, closing connection: {e}");
                        self.state = ConnState::FatalError;
                        return;
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Ack | Event::Nack => {}
            Event::Interrupt => {
                tracing::trace!("GDBStubClient <- <ctrl-c>");
                if self.state == ConnState::Running {
                    self.emit_signal(SIGTRAP, StopReason::Plain);
                }
            }
            Event::Notification(payload) => {
                tracing::trace!("GDBStubClient <- %{payload}");
            }
            Event::Packet(payload) => {
                tracing::trace!("GDBStubClient <- {payload}");
                if self.state == ConnState::PreConnect {
                    tracing::debug!("PreConnect -> Handshake");
                    self.state = ConnState::Handshake;
                }
                match self.state {
                    ConnState::Handshake => self.dispatch_handshake(&payload),
                    ConnState::Running => self.dispatch_running(&payload),
                    _ => {}
                }
            }
        }
    }

    fn reply(&mut self, payload: &str) {
        tracing::trace!("GDBStubClient -> {payload}");
        let framed = protocol::frame_reply(payload, self.no_ack);
        if let Err(e) = self.stream.write_all(&framed) {
            tracing::debug!("failed to write debug reply: {e}");
            self.state = ConnState::Shutdown;
        }
    }

    fn dispatch_handshake(&mut self, payload: &str) {
        if payload == "QStartNoAckMode" {
            self.reply("OK");
            self.no_ack = true;
        } else if payload == "QThreadSuffixSupported" {
            self.reply("OK");
        } else if payload == "qHostInfo" {
            self.reply(&format!("hostname:emulator;vendor:{VENDOR}"));
        } else if payload == "qProcessInfo" {
            let pid = self.target.lock().expect("debug target mutex poisoned").current_pid();
            self.reply(&format!("pid:{pid};vendor:{VENDOR}"));
        } else if payload.starts_with("qGetWorkingDir") {
            self.reply("2f");
        } else if payload.starts_with("qSupported") {
            self.reply(&supported_reply(payload));
        } else if payload == "vCont?" {
            self.reply("");
        } else if payload == "?" {
            self.state = ConnState::Running;
            self.emit_signal(SIGTRAP, StopReason::Plain);
        } else if payload == "c" {
            self.state = ConnState::Running;
            self.reply("OK");
        } else if payload == "QEnableErrorStrings" || payload == "qVAttachOrWaitSupported" {
            self.reply("");
        } else {
            tracing::debug!("unknown handshake packet: {payload}");
            self.reply("");
        }
    }

    fn dispatch_running(&mut self, payload: &str) {
        let mut target = self.target.lock().expect("debug target mutex poisoned");

        if payload == "qProcessInfo" {
            let pid = target.current_pid();
            drop(target);
            self.reply(&format!("pid:{pid};vendor:{VENDOR}"));
        } else if payload == "qfThreadInfo" {
            let reply = if target.is_stopped() { "l" } else { "m1" };
            drop(target);
            self.reply(reply);
        } else if payload == "qsThreadInfo" {
            drop(target);
            self.reply("l");
        } else if let Some(hex) = payload.strip_prefix("qRegisterInfo") {
            let reply = match usize::from_str_radix(hex, 16) {
                Ok(n) => target.register_info(n).map(|info| info.to_reply_string()),
                Err(_) => None,
            };
            drop(target);
            self.reply(reply.as_deref().unwrap_or("E01"));
        } else if payload == "qC" {
            let pid = target.current_pid();
            drop(target);
            self.reply(&format!("QC {pid}"));
        } else if payload == "?" {
            drop(target);
            self.emit_signal(SIGTRAP, StopReason::Plain);
        } else if payload == "k" {
            target.shutdown_cpu();
            drop(target);
            self.reply("");
            self.state = ConnState::Shutdown;
        } else if payload == "c" {
            target.run_cpu();
            drop(target);
            self.reply("OK");
        } else if payload == "s" {
            drop(target);
            self.arm_single_step();
        } else if payload.starts_with("vCont") {
            drop(target);
            self.handle_vcont(payload);
        } else if let Some(rest) = payload.strip_prefix('m').or_else(|| payload.strip_prefix('x')) {
            let is_binary = payload.starts_with('x');
            let reply = parse_addr_len(rest).and_then(|(addr, len)| target.read_memory(addr, len));
            drop(target);
            match reply {
                Some(bytes) => {
                    let hex = protocol::hex_encode(&bytes);
                    self.reply(&if is_binary { format!("b {hex}") } else { hex });
                }
                // m<addr>,<len> reports failure as an empty reply; only
                // x<addr>,<len> (binary read) uses E01.
                None => self.reply(if is_binary { "E01" } else { "" }),
            }
        } else {
            tracing::debug!("unknown running packet: {payload}");
            drop(target);
            self.reply("");
        }
    }

    fn handle_vcont(&mut self, payload: &str) {
        let Some(rest) = payload.strip_prefix("vCont;").or_else(|| payload.strip_prefix("vCont")) else {
            self.reply("");
            return;
        };
        let action = rest.split(';').next().unwrap_or("");
        let action = action.split(':').next().unwrap_or("");
        match action.chars().next() {
            Some('c') => {
                self.target.lock().expect("debug target mutex poisoned").run_cpu();
                self.reply("OK");
            }
            Some('s') => self.arm_single_step(),
            Some('t') => self.emit_signal(SIGTRAP, StopReason::Plain),
            _ => {
                self.target.lock().expect("debug target mutex poisoned").run_cpu();
                self.reply("OK");
            }
        }
    }

    fn arm_single_step(&mut self) {
        let tx = self.step_tx.clone();
        self.target
            .lock()
            .expect("debug target mutex poisoned")
            .step_cpu(1, Box::new(move || { let _ = tx.send(()); }));
    }

    fn emit_signal(&mut self, signal: u8, reason: StopReason) {
        let msg = match reason {
            StopReason::Plain => format!("S{signal:02x}"),
            StopReason::HwBreak => format!("T{SIGTRAP:02x}hwbreak:"),
            StopReason::Watch(addr) => format!("T{SIGTRAP:02x}watch:{addr:04x}"),
        };
        self.target.lock().expect("debug target mutex poisoned").handle_signal(signal);
        self.reply(&msg);
    }
}

#[derive(Debug, Clone, Copy)]
enum StopReason {
    Plain,
    #[allow(dead_code)]
    HwBreak,
    #[allow(dead_code)]
    Watch(u32),
}

fn parse_addr_len(rest: &str) -> Option<(u64, usize)> {
    let (addr_hex, len_hex) = rest.split_once(',')?;
    let addr = u64::from_str_radix(addr_hex, 16).ok()?;
    let len = usize::from_str_radix(len_hex, 16).ok()?;
    Some((addr, len))
}

/// Answers `qSupported:feature±;…` by echoing each client-requested feature
/// against a static support map, then appending the server's own advertised
/// features (§4.8).
fn supported_reply(payload: &str) -> String {
    const SUPPORTED: &[(&str, bool)] = &[
        ("QStartNoAckMode", true),
        ("hwbreak", true),
        ("qXfer:memory-map:read", true),
        ("qXfer:osdata:read", true),
        ("qXfer:features:read", true),
        ("fork", false),
        ("vfork", false),
        ("multiprocess", false),
    ];

    let mut out = String::new();
    if let Some((_, requested)) = payload.split_once(':') {
        for feature in requested.split(';') {
            let name = feature.trim_end_matches(['+', '-', '?']);
            if name.is_empty() {
                continue;
            }
            let supported = SUPPORTED.iter().any(|(n, s)| *n == name && *s);
            out.push_str(name);
            out.push(if supported { '+' } else { '-' });
        }
    }
    for (name, supported) in SUPPORTED {
        out.push_str(name);
        out.push(if *supported { '+' } else { '-' });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_reply_echoes_requested_features_then_advertises_server_features() {
        let reply = supported_reply("qSupported:hwbreak+;swbreak+");
        assert!(reply.starts_with("hwbreak+swbreak-"));
        assert!(reply.contains("QStartNoAckMode+"));
        assert!(reply.contains("fork-"));
    }

    #[test]
    fn parse_addr_len_reads_hex_pair() {
        assert_eq!(parse_addr_len("1000,10"), Some((0x1000, 0x10)));
        assert_eq!(parse_addr_len("bad"), None);
    }
}
