//! SDP body mangling for NAT traversal.
//!
//! Grounded on the registration NAT-awareness pattern in
//! `examples/DasWolke-rsipstack/src/dialog/registration.rs` (detecting a
//! `received`/`rport` pair and rewriting Contact to the publicly observed
//! address), generalized to SDP connection lines. IPv6 connection lines are
//! always emitted as `c=IN IP6 <addr>` with a single separating space.

use std::net::IpAddr;

/// Result of a mangle attempt: the possibly-rewritten body and whether any
/// line was actually changed.
#[derive(Debug, Clone)]
pub struct MangleResult {
    pub body: Vec<u8>,
    pub was_mangled: bool,
}

/// `true` if `addr` is RFC1918 private, link-local, or a ULA/link-local IPv6
/// range — i.e. not routable from the public Internet.
pub fn is_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_link_local() || v4.is_loopback()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || (v6.segments()[0] & 0xffc0) == 0xfe80 // link-local fe80::/10
        }
    }
}

fn address_family_matches(a: IpAddr, b: IpAddr) -> bool {
    matches!(
        (a, b),
        (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_))
    )
}

/// Rewrite private `c=IN IP4/IP6 <addr>` connection lines in `sdp` to
/// `substitute`, but only when the current address is private, the
/// substitute differs, and the address family matches.
pub fn mangle_sdp(sdp: &[u8], substitute: Option<IpAddr>) -> MangleResult {
    let Some(substitute) = substitute else {
        return MangleResult {
            body: sdp.to_vec(),
            was_mangled: false,
        };
    };
    let Ok(text) = std::str::from_utf8(sdp) else {
        return MangleResult {
            body: sdp.to_vec(),
            was_mangled: false,
        };
    };

    let mut was_mangled = false;
    let mut out_lines = Vec::with_capacity(text.lines().count());
    for line in text.lines() {
        match mangle_connection_line(line, substitute) {
            Some(new_line) => {
                was_mangled = true;
                out_lines.push(new_line);
            }
            None => out_lines.push(line.to_string()),
        }
    }

    let mut body = out_lines.join("\r\n");
    if text.ends_with("\r\n") || text.ends_with('\n') {
        body.push_str("\r\n");
    }
    MangleResult {
        body: body.into_bytes(),
        was_mangled,
    }
}

fn mangle_connection_line(line: &str, substitute: IpAddr) -> Option<String> {
    let trimmed = line.trim_end_matches('\r');
    let rest = trimmed.strip_prefix("c=IN IP4 ").map(|r| (r, false));
    let rest = rest.or_else(|| trimmed.strip_prefix("c=IN IP6 ").map(|r| (r, true)));
    let (addr_str, is_v6) = rest?;

    let current: IpAddr = addr_str.trim().parse().ok()?;
    if !is_private(current) {
        return None;
    }
    if current == substitute {
        return None;
    }
    if !address_family_matches(current, substitute) {
        return None;
    }
    let tag = if is_v6 { "c=IN IP6" } else { "c=IN IP4" };
    Some(format!("{} {}", tag, substitute))
}

/// Rewrite a Contact URI's host when it is private and `observed` (the
/// address the peer was actually seen sending from) differs, matching the
/// same family/difference rule as SDP mangling.
pub fn mangle_contact(mut contact: rsip::Uri, observed: Option<IpAddr>) -> rsip::Uri {
    let Some(observed) = observed else {
        return contact;
    };
    let current: Option<IpAddr> = match &contact.host_with_port.host {
        rsip::Host::IpAddr(ip) => Some(*ip),
        rsip::Host::Domain(_) => None,
    };
    if let Some(current) = current {
        if is_private(current) && current != observed && address_family_matches(current, observed)
        {
            contact.host_with_port.host = rsip::Host::IpAddr(observed);
        }
    }
    contact
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sdp(addr: &str) -> Vec<u8> {
        format!(
            "v=0\r\no=- 1 1 IN IP4 {addr}\r\ns=-\r\nc=IN IP4 {addr}\r\nt=0 0\r\nm=audio 49170 RTP/AVP 0\r\n",
            addr = addr
        )
        .into_bytes()
    }

    #[test]
    fn mangles_private_v4_address() {
        let result = mangle_sdp(
            &sdp("192.168.1.10"),
            Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5))),
        );
        assert!(result.was_mangled);
        let text = String::from_utf8(result.body).unwrap();
        assert!(text.contains("c=IN IP4 203.0.113.5"));
        // Origin line is untouched — only the connection line is rewritten.
        assert!(text.contains("o=- 1 1 IN IP4 192.168.1.10"));
    }

    #[test]
    fn skips_when_no_substitute_configured() {
        let result = mangle_sdp(&sdp("10.0.0.5"), None);
        assert!(!result.was_mangled);
    }

    #[test]
    fn skips_when_address_already_matches() {
        let result = mangle_sdp(
            &sdp("203.0.113.5"),
            Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5))),
        );
        assert!(!result.was_mangled);
    }

    #[test]
    fn ipv6_replacement_has_a_separating_space() {
        let body = "v=0\r\nc=IN IP6 fe80::1\r\n".as_bytes();
        let result = mangle_sdp(&body, Some("2001:db8::1".parse().unwrap()));
        let text = String::from_utf8(result.body).unwrap();
        assert!(text.contains("c=IN IP6 2001:db8::1"));
        assert!(!text.contains("c=IN IP62001"));
    }
}
