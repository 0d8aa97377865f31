//! The few RFB (VNC) wire messages the relay has to understand.

use serde::Deserialize;

use crate::error::QvmError;

/// `RFB xxx.yyy\n`
pub const BANNER_LEN: usize = 12;

/// ServerInit up to and including the name length
pub const SERVER_INIT_FIXED_LEN: usize = 24;

pub const SECURITY_NONE: u8 = 1;
pub const SECURITY_VNC_AUTH: u8 = 2;

const VNC_AUTH_RESPONSE_LEN: usize = 16;

const SET_PIXEL_FORMAT: u8 = 0;
const SET_ENCODINGS: u8 = 2;
const FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
const KEY_EVENT: u8 = 4;
const POINTER_EVENT: u8 = 5;
const CLIENT_CUT_TEXT: u8 = 6;

/// Parse the server's protocol version banner.
pub fn parse_banner(banner: &[u8]) -> Result<(u16, u16), QvmError> {
    let invalid = || {
        QvmError::bridge(format!(
            "guest display sent an invalid RFB banner: {:?}",
            String::from_utf8_lossy(banner)
        ))
    };
    if banner.len() != BANNER_LEN || !banner.starts_with(b"RFB ") || banner[11] != b'\n' || banner[7] != b'.' {
        return Err(invalid());
    }
    let field = |b: &[u8]| -> Option<u16> {
        if !b.iter().all(u8::is_ascii_digit) {
            return None;
        }
        std::str::from_utf8(b).ok()?.parse().ok()
    };
    let major = field(&banner[4..7]).ok_or_else(invalid)?;
    let minor = field(&banner[8..11]).ok_or_else(invalid)?;
    Ok((major, minor))
}

/// ClientCutText: type, 3 bytes padding, u32 length, Latin-1 text.
/// Characters outside Latin-1 become `?`.
pub fn client_cut_text(text: &str) -> Vec<u8> {
    let latin1: Vec<u8> = text
        .chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect();
    let mut msg = Vec::with_capacity(8 + latin1.len());
    msg.push(CLIENT_CUT_TEXT);
    msg.extend_from_slice(&[0, 0, 0]);
    msg.extend_from_slice(&(latin1.len() as u32).to_be_bytes());
    msg.extend_from_slice(&latin1);
    msg
}

/// KeyEvent: type, down flag, 2 bytes padding, u32 keysym.
pub fn key_event(down: bool, keysym: u32) -> [u8; 8] {
    let mut msg = [0u8; 8];
    msg[0] = KEY_EVENT;
    msg[1] = u8::from(down);
    msg[4..].copy_from_slice(&keysym.to_be_bytes());
    msg
}

/// Press every key in order, then release in reverse.
pub fn key_combo(keysyms: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(keysyms.len() * 16);
    for &k in keysyms {
        out.extend_from_slice(&key_event(true, k));
    }
    for &k in keysyms.iter().rev() {
        out.extend_from_slice(&key_event(false, k));
    }
    out
}

/// FramebufferUpdateRequest for the given area
pub fn framebuffer_update_request(incremental: bool, width: u16, height: u16) -> [u8; 10] {
    let mut msg = [0u8; 10];
    msg[0] = FRAMEBUFFER_UPDATE_REQUEST;
    msg[1] = u8::from(incremental);
    msg[6..8].copy_from_slice(&width.to_be_bytes());
    msg[8..10].copy_from_slice(&height.to_be_bytes());
    msg
}

/// Width, height and name length from the fixed part of a ServerInit
pub fn parse_server_init(fixed: &[u8; SERVER_INIT_FIXED_LEN]) -> (u16, u16, u32) {
    let width = u16::from_be_bytes([fixed[0], fixed[1]]);
    let height = u16::from_be_bytes([fixed[2], fixed[3]]);
    let name_len = u32::from_be_bytes([fixed[20], fixed[21], fixed[22], fixed[23]]);
    (width, height, name_len)
}

enum Unit {
    Len(usize),
    Incomplete,
    Unknown,
}

/// Length of the client message at the start of `buf`
fn client_message_len(buf: &[u8]) -> Unit {
    let Some(&kind) = buf.first() else {
        return Unit::Incomplete;
    };
    match kind {
        SET_PIXEL_FORMAT => Unit::Len(20),
        FRAMEBUFFER_UPDATE_REQUEST => Unit::Len(10),
        KEY_EVENT => Unit::Len(8),
        POINTER_EVENT => Unit::Len(6),
        SET_ENCODINGS if buf.len() < 4 => Unit::Incomplete,
        SET_ENCODINGS => Unit::Len(4 + 4 * usize::from(u16::from_be_bytes([buf[2], buf[3]]))),
        CLIENT_CUT_TEXT if buf.len() < 8 => Unit::Incomplete,
        CLIENT_CUT_TEXT => {
            // extended clipboard uses a negative length
            let len = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]).unsigned_abs();
            Unit::Len(8 + len as usize)
        }
        _ => Unit::Unknown,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientPhase {
    Version,
    SecurityChoice,
    AuthResponse,
    ClientInit,
    Messages,
    /// Unsupported version or message type; bytes pass through untracked
    Opaque,
}

/// What a new guest connection needs before the viewer's stream can continue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resume {
    /// The viewer has not finished sending its version; nothing to replay
    Fresh,
    Replay(ReplayScript),
}

/// Client side of a completed handshake, plus the viewer's pixel format and
/// encodings, to be sent again to a new guest connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayScript {
    pub version: Vec<u8>,
    pub minor: u16,
    pub shared: u8,
    /// SetPixelFormat and SetEncodings, in that order
    pub setup: Vec<u8>,
}

/// Cuts the viewer→guest byte stream into whole RFB units.
///
/// Only complete units are released, so bytes injected by the bridge
/// (clipboard, key combos) never land inside a viewer message and a new
/// guest connection never starts mid-message.
#[derive(Debug)]
pub struct ClientFramer {
    phase: ClientPhase,
    buf: Vec<u8>,
    pending: Vec<u8>,
    version: Vec<u8>,
    minor: u16,
    security: Option<u8>,
    shared: u8,
    pixel_format: Option<Vec<u8>>,
    encodings: Option<Vec<u8>>,
}

impl Default for ClientFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientFramer {
    pub fn new() -> Self {
        Self {
            phase: ClientPhase::Version,
            buf: Vec::new(),
            pending: Vec::new(),
            version: Vec::new(),
            minor: 0,
            security: None,
            shared: 0,
            pixel_format: None,
            encodings: None,
        }
    }

    /// Take viewer bytes; returns what can be written to the guest now.
    pub fn feed(&mut self, data: &[u8]) -> Vec<u8> {
        if self.phase == ClientPhase::Opaque {
            return data.to_vec();
        }
        self.buf.extend_from_slice(data);

        let mut out = Vec::new();
        loop {
            let len = match self.unit_len() {
                Unit::Len(n) if self.buf.len() >= n => n,
                Unit::Len(_) | Unit::Incomplete => break,
                Unit::Unknown => {
                    self.phase = ClientPhase::Opaque;
                    out.append(&mut self.buf);
                    out.append(&mut self.pending);
                    break;
                }
            };
            let unit: Vec<u8> = self.buf.drain(..len).collect();
            self.advance(&unit);
            out.extend_from_slice(&unit);
            if self.at_boundary() {
                out.append(&mut self.pending);
            }
            if self.phase == ClientPhase::Opaque {
                out.append(&mut self.buf);
                break;
            }
        }
        out
    }

    /// Bridge-generated message; returned at once when the stream is between
    /// messages, otherwise held until the next boundary.
    pub fn inject(&mut self, msg: Vec<u8>) -> Vec<u8> {
        if self.at_boundary() {
            msg
        } else {
            self.pending.extend_from_slice(&msg);
            Vec::new()
        }
    }

    /// Between two whole messages of an established session
    pub fn at_boundary(&self) -> bool {
        match self.phase {
            ClientPhase::Messages => self.buf.is_empty(),
            ClientPhase::Opaque => true,
            _ => false,
        }
    }

    /// How a replacement guest connection can pick up this viewer
    pub fn resume(&self) -> Result<Resume, QvmError> {
        match self.phase {
            ClientPhase::Version => Ok(Resume::Fresh),
            ClientPhase::Messages if self.security == Some(SECURITY_NONE) => {
                let mut setup = Vec::new();
                if let Some(pf) = &self.pixel_format {
                    setup.extend_from_slice(pf);
                }
                if let Some(enc) = &self.encodings {
                    setup.extend_from_slice(enc);
                }
                Ok(Resume::Replay(ReplayScript {
                    version: self.version.clone(),
                    minor: self.minor,
                    shared: self.shared,
                    setup,
                }))
            }
            ClientPhase::Messages => Err(QvmError::bridge(format!(
                "security type {} needs a fresh challenge, cannot resume viewer",
                self.security.unwrap_or_default()
            ))),
            ClientPhase::Opaque => Err(QvmError::bridge(
                "viewer stream uses an unsupported RFB version or message, cannot resume",
            )),
            _ => Err(QvmError::bridge("guest display reset during the RFB handshake")),
        }
    }

    fn unit_len(&self) -> Unit {
        match self.phase {
            ClientPhase::Version => Unit::Len(BANNER_LEN),
            ClientPhase::SecurityChoice | ClientPhase::ClientInit => Unit::Len(1),
            ClientPhase::AuthResponse => Unit::Len(VNC_AUTH_RESPONSE_LEN),
            ClientPhase::Messages => client_message_len(&self.buf),
            ClientPhase::Opaque => Unit::Unknown,
        }
    }

    fn advance(&mut self, unit: &[u8]) {
        self.phase = match self.phase {
            ClientPhase::Version => match parse_banner(unit) {
                Ok((_, minor)) if minor >= 7 => {
                    self.version = unit.to_vec();
                    self.minor = minor;
                    ClientPhase::SecurityChoice
                }
                _ => ClientPhase::Opaque,
            },
            ClientPhase::SecurityChoice => {
                self.security = Some(unit[0]);
                match unit[0] {
                    SECURITY_NONE => ClientPhase::ClientInit,
                    SECURITY_VNC_AUTH => ClientPhase::AuthResponse,
                    _ => ClientPhase::Opaque,
                }
            }
            ClientPhase::AuthResponse => ClientPhase::ClientInit,
            ClientPhase::ClientInit => {
                self.shared = unit[0];
                ClientPhase::Messages
            }
            ClientPhase::Messages => {
                match unit[0] {
                    SET_PIXEL_FORMAT => self.pixel_format = Some(unit.to_vec()),
                    SET_ENCODINGS => self.encodings = Some(unit.to_vec()),
                    _ => {}
                }
                ClientPhase::Messages
            }
            ClientPhase::Opaque => ClientPhase::Opaque,
        };
    }
}

/// JSON control message sent by a viewer as a text frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Clipboard { text: String },
    Keys { keys: Vec<u32> },
}

impl ControlMessage {
    pub fn parse(text: &str) -> Result<Self, QvmError> {
        serde_json::from_str(text)
            .map_err(|e| QvmError::bridge(format!("invalid control message: {}", e)))
    }

    /// RFB bytes to write to the guest
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ControlMessage::Clipboard { text } => client_cut_text(text),
            ControlMessage::Keys { keys } => key_combo(keys),
        }
    }
}
