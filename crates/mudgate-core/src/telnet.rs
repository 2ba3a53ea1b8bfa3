//! Telnet negotiation filter for the upstream byte stream.
//!
//! The proxy answers exactly one option on behalf of the browser client:
//! NEW-ENVIRON (RFC 1572, option 39), used by MUD servers to learn the real
//! client IP behind the proxy. Everything else in the stream passes through
//! to the client verbatim.
//!
//! Input arrives in arbitrary chunks; bytes that cannot be classified yet
//! (a trailing partial IAC sequence or an unterminated subnegotiation) are
//! retained in a scratch buffer until the next chunk.

/// Interpret As Command: escape byte introducing telnet control framing.
pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
/// Subnegotiation begin.
pub const SB: u8 = 250;
/// Subnegotiation end.
pub const SE: u8 = 240;

/// NEW-ENVIRON option code.
pub const NEW_ENVIRON: u8 = 39;

// NEW-ENVIRON sub-option codes (RFC 1572). VAR and IS share a value, as do
// VALUE and SEND; which applies depends on position in the payload.
pub const ENV_IS: u8 = 0;
pub const ENV_SEND: u8 = 1;
pub const ENV_INFO: u8 = 2;
pub const ENV_VAR: u8 = 0;
pub const ENV_VALUE: u8 = 1;
pub const ENV_ESC: u8 = 2;
pub const ENV_USERVAR: u8 = 3;

/// Variable name the proxy answers for.
const IP_VARIABLE: &[u8] = b"IPADDRESS";

/// Result of feeding one chunk through the filter.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FilterOutput {
    /// Bytes to forward to the attached client (or the replay buffer).
    pub to_client: Vec<u8>,
    /// Reply bytes to write back to the upstream.
    pub to_upstream: Vec<u8>,
}

/// Streaming filter state, one per session.
#[derive(Debug, Default)]
pub struct TelnetFilter {
    scratch: Vec<u8>,
    negotiated: bool,
}

impl TelnetFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the upstream has asked for NEW-ENVIRON and we agreed.
    pub fn negotiated(&self) -> bool {
        self.negotiated
    }

    /// Feed one chunk of upstream bytes; `client_ip` is the address to
    /// report if the upstream requests it in this chunk.
    pub fn feed(&mut self, chunk: &[u8], client_ip: &str) -> FilterOutput {
        let mut buf = std::mem::take(&mut self.scratch);
        buf.extend_from_slice(chunk);

        let mut out = FilterOutput::default();
        let mut pos = 0;

        while pos < buf.len() {
            if buf[pos] != IAC {
                // Forward the whole run of plain data at once.
                let run_end = buf[pos..]
                    .iter()
                    .position(|&b| b == IAC)
                    .map_or(buf.len(), |off| pos + off);
                out.to_client.extend_from_slice(&buf[pos..run_end]);
                pos = run_end;
                continue;
            }

            if pos + 1 >= buf.len() {
                break; // lone IAC at the tail, wait for more
            }

            match buf[pos + 1] {
                IAC => {
                    // Escaped literal 0xFF, forwarded as-is.
                    out.to_client.extend_from_slice(&buf[pos..pos + 2]);
                    pos += 2;
                }
                cmd @ (DO | DONT | WILL | WONT) => {
                    if pos + 2 >= buf.len() {
                        break;
                    }
                    let option = buf[pos + 2];
                    if cmd == DO && option == NEW_ENVIRON {
                        out.to_upstream
                            .extend_from_slice(&[IAC, WILL, NEW_ENVIRON]);
                        self.negotiated = true;
                    } else {
                        out.to_client.extend_from_slice(&buf[pos..pos + 3]);
                    }
                    pos += 3;
                }
                SB => match find_subneg_end(&buf[pos..]) {
                    Some(len) => {
                        let seq = &buf[pos..pos + len];
                        if seq[2] == NEW_ENVIRON {
                            let payload = unescape_iac(&seq[3..seq.len() - 2]);
                            if payload.first() == Some(&ENV_SEND)
                                && send_requests_ip(&payload[1..])
                            {
                                out.to_upstream.extend(build_env_subneg(
                                    ENV_IS,
                                    IP_VARIABLE,
                                    client_ip.as_bytes(),
                                ));
                            }
                        } else {
                            out.to_client.extend_from_slice(seq);
                        }
                        pos += len;
                    }
                    None => break, // unterminated, keep accumulating
                },
                _ => {
                    // Any other 2-byte command passes through unchanged.
                    out.to_client.extend_from_slice(&buf[pos..pos + 2]);
                    pos += 2;
                }
            }
        }

        self.scratch = buf.split_off(pos);
        out
    }

    /// Unsolicited IP re-announcement after a reattach changed the client
    /// address. Returns `None` until the upstream has negotiated the option.
    pub fn address_update(&self, new_ip: &str) -> Option<Vec<u8>> {
        self.negotiated
            .then(|| build_env_subneg(ENV_INFO, IP_VARIABLE, new_ip.as_bytes()))
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.scratch.len()
    }
}

/// Find the length of a complete `IAC SB … IAC SE` sequence at the start of
/// `buf`, skipping escaped `IAC IAC` pairs inside the payload.
fn find_subneg_end(buf: &[u8]) -> Option<usize> {
    let mut i = 3; // past IAC SB <option>
    while i + 1 < buf.len() {
        if buf[i] == IAC {
            if buf[i + 1] == SE {
                return Some(i + 2);
            }
            i += 2;
        } else {
            i += 1;
        }
    }
    None
}

/// Collapse `IAC IAC` pairs into literal 0xFF bytes.
fn unescape_iac(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == IAC && i + 1 < data.len() && data[i + 1] == IAC {
            out.push(IAC);
            i += 2;
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}

/// Whether a SEND request body (after the SEND byte) asks for IPADDRESS.
/// An empty body means "send everything you have".
fn send_requests_ip(body: &[u8]) -> bool {
    if body.is_empty() {
        return true;
    }
    let mut i = 0;
    while i < body.len() {
        if body[i] != ENV_VAR && body[i] != ENV_USERVAR {
            i += 1; // tolerate junk between names
            continue;
        }
        i += 1;
        let mut name = Vec::new();
        while i < body.len() {
            match body[i] {
                ENV_ESC if i + 1 < body.len() => {
                    name.push(body[i + 1]);
                    i += 2;
                }
                ENV_VAR | ENV_USERVAR => break,
                b => {
                    name.push(b);
                    i += 1;
                }
            }
        }
        if name == IP_VARIABLE {
            return true;
        }
    }
    false
}

/// Build a full `IAC SB NEW-ENVIRON <IS|INFO> VAR name VALUE value IAC SE`
/// subnegotiation, escaping both the name and the value.
fn build_env_subneg(kind: u8, name: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + value.len() + 8);
    out.extend_from_slice(&[IAC, SB, NEW_ENVIRON, kind, ENV_VAR]);
    escape_env(&mut out, name);
    out.push(ENV_VALUE);
    escape_env(&mut out, value);
    out.extend_from_slice(&[IAC, SE]);
    out
}

/// Escape bytes for transport inside a NEW-ENVIRON payload: 0xFF doubles as
/// `IAC IAC`, the four sub-option codes get an ESC prefix.
fn escape_env(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        match b {
            IAC => out.extend_from_slice(&[IAC, IAC]),
            ENV_VAR | ENV_VALUE | ENV_ESC | ENV_USERVAR => {
                out.extend_from_slice(&[ENV_ESC, b])
            }
            _ => out.push(b),
        }
    }
}
