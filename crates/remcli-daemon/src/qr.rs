//! Connect-URL construction and terminal QR rendering.

use remcli_auth::SECRET_BYTES;
use remcli_protocol::{ConnectPayload, PROTOCOL_VERSION};

/// Where clients should connect.
pub enum Endpoint {
    Lan { host: String, port: u16 },
    /// Port 0 in the payload signals tunnel mode; `host` carries the full
    /// URL including scheme.
    Tunnel { url: String },
}

/// Build `scheme://host:port/terminal/connect#<percent-encoded JSON>`.
pub fn connect_url(endpoint: &Endpoint, secret: &[u8; SECRET_BYTES]) -> String {
    let key = remcli_auth::encode_secret(secret);
    let (base, payload) = match endpoint {
        Endpoint::Lan { host, port } => (
            format!("http://{host}:{port}"),
            ConnectPayload {
                mode: "p2p".to_string(),
                host: host.clone(),
                port: *port,
                key,
                v: PROTOCOL_VERSION,
            },
        ),
        Endpoint::Tunnel { url } => {
            let base = url.trim_end_matches('/').to_string();
            (
                base.clone(),
                ConnectPayload {
                    mode: "p2p".to_string(),
                    host: base,
                    port: 0,
                    key,
                    v: PROTOCOL_VERSION,
                },
            )
        }
    };
    let json = serde_json::to_string(&payload).expect("connect payload serialises");
    format!("{base}/terminal/connect#{}", percent_encode(&json))
}

/// Render the QR to stderr and the plain URL beneath it.
pub fn display(url: &str) {
    eprintln!();
    eprintln!("  Scan to connect:");
    eprintln!();
    match qr2term::generate_qr_string(url) {
        Ok(qr) => eprint!("{qr}"),
        Err(err) => eprintln!("  (QR rendering failed: {err})"),
    }
    eprintln!();
    eprintln!("  {url}");
    eprintln!();
}

/// RFC 3986 percent-encoding of everything but unreserved characters.
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            other => {
                out.push('%');
                out.push_str(&format!("{other:02X}"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn percent_decode(input: &str) -> String {
        let bytes = input.as_bytes();
        let mut out = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'%' {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap();
                out.push(u8::from_str_radix(hex, 16).unwrap());
                i += 3;
            } else {
                out.push(bytes[i]);
                i += 1;
            }
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn lan_url_embeds_host_port_and_key() {
        let secret = [3u8; SECRET_BYTES];
        let url = connect_url(
            &Endpoint::Lan {
                host: "192.168.1.5".into(),
                port: 4200,
            },
            &secret,
        );
        assert!(url.starts_with("http://192.168.1.5:4200/terminal/connect#"));

        let fragment = url.split('#').nth(1).unwrap();
        let payload: ConnectPayload =
            serde_json::from_str(&percent_decode(fragment)).unwrap();
        assert_eq!(payload.mode, "p2p");
        assert_eq!(payload.host, "192.168.1.5");
        assert_eq!(payload.port, 4200);
        assert_eq!(payload.v, PROTOCOL_VERSION);
        assert_eq!(
            remcli_auth::decode_secret(&payload.key),
            Some(secret)
        );
    }

    #[test]
    fn tunnel_url_signals_port_zero() {
        let secret = [9u8; SECRET_BYTES];
        let url = connect_url(
            &Endpoint::Tunnel {
                url: "https://example.trycloudflare.com/".into(),
            },
            &secret,
        );
        assert!(url.starts_with("https://example.trycloudflare.com/terminal/connect#"));
        let fragment = url.split('#').nth(1).unwrap();
        let payload: ConnectPayload =
            serde_json::from_str(&percent_decode(fragment)).unwrap();
        assert_eq!(payload.port, 0);
        assert_eq!(payload.host, "https://example.trycloudflare.com");
    }

    #[test]
    fn fragment_is_fully_percent_encoded() {
        let encoded = percent_encode(r#"{"a":"b c"}"#);
        assert!(!encoded.contains('{'));
        assert!(!encoded.contains('"'));
        assert!(!encoded.contains(' '));
        assert_eq!(percent_decode(&encoded), r#"{"a":"b c"}"#);
    }
}
