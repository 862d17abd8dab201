// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result, anyhow};
use russh::{ChannelMsg, Sig};

use super::{ClientHandler, SessionManager};

/// Folds one channel message into the capture buffers; true once the
/// channel is closed.
fn handle_capture_message(
    msg: &ChannelMsg,
    out: &mut Vec<u8>,
    err: &mut Vec<u8>,
    code: &mut Option<i32>,
) -> bool {
    match msg {
        ChannelMsg::Data { data } => {
            out.extend_from_slice(data);
            false
        }
        ChannelMsg::ExtendedData { data, ext: 1 } => {
            err.extend_from_slice(data);
            false
        }
        ChannelMsg::ExitStatus { exit_status } => {
            *code = Some(*exit_status as i32);
            false
        }
        ChannelMsg::ExitSignal { signal_name, .. } => {
            code.get_or_insert(signal_exit_code(signal_name));
            false
        }
        ChannelMsg::Close => true,
        _ => false,
    }
}

/// Shell convention for a process killed by a signal: 128 + signal number.
fn signal_exit_code(signal: &Sig) -> i32 {
    let number = match signal {
        Sig::HUP => 1,
        Sig::INT => 2,
        Sig::QUIT => 3,
        Sig::ILL => 4,
        Sig::ABRT => 6,
        Sig::FPE => 8,
        Sig::KILL => 9,
        Sig::USR1 => 10,
        Sig::SEGV => 11,
        Sig::PIPE => 13,
        Sig::ALRM => 14,
        Sig::TERM => 15,
        Sig::Custom(_) => 0,
    };
    128 + number
}

pub(super) async fn run_on_handle(
    handle: &russh::client::Handle<ClientHandler>,
    cmd: &str,
) -> Result<(Vec<u8>, Vec<u8>, i32)> {
    let mut chan = handle
        .channel_open_session()
        .await
        .context("open session")?;
    chan.exec(true, cmd).await.context("exec request")?;
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut code = None;
    while let Some(msg) = chan.wait().await {
        if handle_capture_message(&msg, &mut out, &mut err, &mut code) {
            break;
        }
    }
    let _ = chan.close().await;
    // Neither an exit status nor an exit signal: the transport gave out.
    let code = code.ok_or_else(|| anyhow!("channel closed without an exit status"))?;
    Ok((out, err, code))
}

impl SessionManager {
    /// Runs `cmd` and returns stdout, stderr and the exit code.
    pub async fn exec_capture(&self, cmd: &str) -> Result<(Vec<u8>, Vec<u8>, i32)> {
        let guard = self.handle.lock().await;
        let handle = guard
            .as_ref()
            .filter(|h| !h.is_closed())
            .ok_or_else(|| anyhow!("SSH session is not connected"))?;
        log::debug!("executing '{cmd}'");
        run_on_handle(handle, cmd).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::CryptoVec;

    fn feed(msgs: &[ChannelMsg]) -> (Vec<u8>, Vec<u8>, Option<i32>, bool) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut code = None;
        let mut closed = false;
        for msg in msgs {
            if handle_capture_message(msg, &mut out, &mut err, &mut code) {
                closed = true;
                break;
            }
        }
        (out, err, code, closed)
    }

    #[test]
    fn collects_streams_and_exit_status() {
        let (out, err, code, closed) = feed(&[
            ChannelMsg::Data {
                data: CryptoVec::from_slice(b"Submitted"),
            },
            ChannelMsg::ExtendedData {
                data: CryptoVec::from_slice(b"warn"),
                ext: 1,
            },
            ChannelMsg::Data {
                data: CryptoVec::from_slice(b" 1001\n"),
            },
            ChannelMsg::ExitStatus { exit_status: 127 },
            ChannelMsg::Close,
        ]);
        assert_eq!(out, b"Submitted 1001\n");
        assert_eq!(err, b"warn");
        assert_eq!(code, Some(127));
        assert!(closed);
    }

    #[test]
    fn ignores_other_extended_streams() {
        let (_, err, code, closed) = feed(&[ChannelMsg::ExtendedData {
            data: CryptoVec::from_slice(b"x"),
            ext: 2,
        }]);
        assert!(err.is_empty());
        assert_eq!(code, None);
        assert!(!closed);
    }

    #[test]
    fn killed_command_reports_a_signal_exit_code() {
        let (_, _, code, closed) = feed(&[
            ChannelMsg::ExitSignal {
                signal_name: Sig::KILL,
                core_dumped: false,
                error_message: String::new(),
                lang_tag: String::new(),
            },
            ChannelMsg::Close,
        ]);
        assert_eq!(code, Some(137));
        assert!(closed);
        assert_eq!(signal_exit_code(&Sig::TERM), 143);
        assert_eq!(signal_exit_code(&Sig::Custom("XCPU".into())), 128);
    }
}
