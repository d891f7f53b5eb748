//! ZAP (RFC 27) authentication handling.
//!
//! The transport completes the curve handshake and then asks us, over the
//! `inproc://zeromq.zap.01` REP socket, whether the verified client key may
//! connect. We consult the application's allow-connection callback and record
//! the granted level so the listener can attach it to the peer's first frame.

use crate::config::AllowFn;
use crate::types::{Allow, Pubkey};
use tracing::warn;

pub(crate) const ZAP_ENDPOINT: &str = "inproc://zeromq.zap.01";

const ZAP_VERSION: &[u8] = b"1.0";
const MECHANISM_CURVE: &[u8] = b"CURVE";

/// Outcome of evaluating one ZAP request.
pub(crate) struct ZapOutcome {
    /// Reply frames to send back on the ZAP socket.
    pub reply: Vec<Vec<u8>>,
    /// Decision to record for the listener, when the handshake was admitted.
    pub admitted: Option<(Pubkey, Allow)>,
    /// Key refused by the admission callback, for the caller's logging.
    pub denied: Option<Pubkey>,
}

fn reply_frames(request_id: &[u8], status: &str, text: &str, user_id: String) -> Vec<Vec<u8>> {
    vec![
        ZAP_VERSION.to_vec(),
        request_id.to_vec(),
        status.as_bytes().to_vec(),
        text.as_bytes().to_vec(),
        user_id.into_bytes(),
        Vec::new(),
    ]
}

/// Evaluates a single ZAP request against the admission callback.
///
/// Request frames are `[version, request_id, domain, address, identity,
/// mechanism, credential…]`; only curve requests carrying a 32-byte client
/// key are meaningful here.
pub(crate) fn evaluate(parts: &[Vec<u8>], allow: &AllowFn) -> ZapOutcome {
    let request_id = parts.get(1).map_or(&[][..], Vec::as_slice);
    let fail = |status: &str, text: &str| ZapOutcome {
        reply: reply_frames(request_id, status, text, String::new()),
        admitted: None,
        denied: None,
    };

    if parts.len() < 7 {
        warn!(frames = parts.len(), "malformed ZAP request");
        return fail("500", "Internal error");
    }
    if parts[0] != ZAP_VERSION {
        warn!("unsupported ZAP version");
        return fail("500", "Internal error");
    }
    if parts[5] != MECHANISM_CURVE {
        warn!(
            mechanism = %String::from_utf8_lossy(&parts[5]),
            "unsupported ZAP mechanism"
        );
        return fail("500", "Internal error");
    }
    let Ok(pubkey) = Pubkey::try_from(parts[6].as_slice()) else {
        warn!("ZAP curve credential is not a 32-byte key");
        return fail("500", "Internal error");
    };
    let ip = String::from_utf8_lossy(&parts[3]);

    let decision = allow(&ip, &pubkey);
    if decision.is_denied() {
        return ZapOutcome {
            reply: reply_frames(request_id, "400", "Access denied", String::new()),
            admitted: None,
            denied: Some(pubkey),
        };
    }

    ZapOutcome {
        reply: reply_frames(request_id, "200", "OK", hex::encode(pubkey)),
        admitted: Some((pubkey, decision)),
        denied: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuthLevel;

    fn request(mechanism: &[u8], credential: &[u8]) -> Vec<Vec<u8>> {
        vec![
            b"1.0".to_vec(),
            b"1".to_vec(),
            b"auth".to_vec(),
            b"192.168.1.5".to_vec(),
            Vec::new(),
            mechanism.to_vec(),
            credential.to_vec(),
        ]
    }

    fn allow_all() -> AllowFn {
        Box::new(|_ip, _pk| Allow::new(AuthLevel::Basic, true))
    }

    #[test]
    fn valid_request_is_admitted_with_hex_user_id() {
        let pk = [0xabu8; 32];
        let outcome = evaluate(&request(b"CURVE", &pk), &allow_all());
        assert_eq!(outcome.reply[2], b"200");
        assert_eq!(outcome.reply[4], hex::encode(pk).into_bytes());
        let (admitted_pk, allow) = outcome.admitted.unwrap();
        assert_eq!(admitted_pk, pk);
        assert_eq!(allow.auth, AuthLevel::Basic);
        assert!(allow.service_node);
    }

    #[test]
    fn denied_connection_gets_400_and_no_record() {
        let deny: AllowFn = Box::new(|_ip, _pk| Allow::denied());
        let outcome = evaluate(&request(b"CURVE", &[1u8; 32]), &deny);
        assert_eq!(outcome.reply[2], b"400");
        assert!(outcome.admitted.is_none());
        assert_eq!(outcome.denied, Some([1u8; 32]));
    }

    #[test]
    fn callback_sees_the_request_ip() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(String::new()));
        let seen2 = seen.clone();
        let allow: AllowFn = Box::new(move |ip, _pk| {
            *seen2.lock().unwrap() = ip.to_owned();
            Allow::new(AuthLevel::None, false)
        });
        let _ = evaluate(&request(b"CURVE", &[1u8; 32]), &allow);
        assert_eq!(&*seen.lock().unwrap(), "192.168.1.5");
    }

    #[test]
    fn non_curve_mechanism_is_an_internal_error() {
        let outcome = evaluate(&request(b"PLAIN", b"user"), &allow_all());
        assert_eq!(outcome.reply[2], b"500");
        assert!(outcome.admitted.is_none());
    }

    #[test]
    fn short_or_malformed_requests_get_500() {
        let outcome = evaluate(&[b"1.0".to_vec()], &allow_all());
        assert_eq!(outcome.reply[2], b"500");

        let outcome = evaluate(&request(b"CURVE", &[1u8; 16]), &allow_all());
        assert_eq!(outcome.reply[2], b"500");
    }

    #[test]
    fn reply_echoes_the_request_id() {
        let mut req = request(b"CURVE", &[1u8; 32]);
        req[1] = b"req-77".to_vec();
        let outcome = evaluate(&req, &allow_all());
        assert_eq!(outcome.reply[1], b"req-77");
    }
}
