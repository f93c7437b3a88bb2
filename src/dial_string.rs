//! Dial-string mini-language: `key=value;key=value` options layered on top
//! of a `CallDescriptor`, tolerant of unknown keys.
//!
//! The source regex-parses these; we re-express parsing as a plain
//! `split(';')`/`split_once('=')` walk into a config struct, which is both
//! simpler and trivially tolerant of keys it doesn't recognize.

use std::time::Duration;

use crate::descriptor::{CallDescriptor, RedirectMode};
use crate::dialog::TransferMode;

/// The subset of `CallDescriptor` the dial-string keys can express.
#[derive(Debug, Clone, PartialEq)]
pub struct DialStringOptions {
    pub delay_seconds: u32,
    pub redirect_mode: RedirectMode,
    pub call_duration_limit: Option<u64>,
    pub mangle_response_sdp: bool,
    pub from_display_name: Option<String>,
    pub from_uri_user: Option<String>,
    pub from_uri_host: Option<String>,
    pub transfer_mode: TransferMode,
    pub request_caller_details: bool,
    pub account_code: Option<String>,
    pub rate_code: Option<String>,
    pub reinvite_delay: u32,
}

impl Default for DialStringOptions {
    fn default() -> Self {
        Self {
            delay_seconds: 0,
            redirect_mode: RedirectMode::None,
            call_duration_limit: None,
            mangle_response_sdp: true,
            from_display_name: None,
            from_uri_user: None,
            from_uri_host: None,
            transfer_mode: TransferMode::Default,
            request_caller_details: false,
            account_code: None,
            rate_code: None,
            reinvite_delay: crate::descriptor::MAX_REINVITE_DELAY.min(2),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "y" | "yes")
}

/// Parse `dt=5;rm=m;cd=3600;ma=1;tr=p;...` into `DialStringOptions`. Unknown
/// keys are ignored. The legacy `ir=*` switch always means
/// `reinvite-delay=2`, regardless of its value.
pub fn parse(options: &str) -> DialStringOptions {
    let mut out = DialStringOptions::default();
    let mut saw_ir = false;

    for pair in options.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            "dt" => {
                if let Ok(v) = value.parse() {
                    out.delay_seconds = v;
                }
            }
            "rm" => {
                out.redirect_mode = match value {
                    "n" => RedirectMode::NewDialPlan,
                    "m" => RedirectMode::Manual,
                    _ => RedirectMode::None,
                };
            }
            "cd" => {
                if let Ok(v) = value.parse() {
                    out.call_duration_limit = Some(v);
                }
            }
            "ma" => out.mangle_response_sdp = parse_bool(value),
            "fd" => out.from_display_name = Some(value.to_string()),
            "fu" => out.from_uri_user = Some(value.to_string()),
            "fh" => out.from_uri_host = Some(value.to_string()),
            "tr" => {
                out.transfer_mode = match value {
                    "n" => TransferMode::NotAllowed,
                    "p" => TransferMode::PassThrough,
                    "c" => TransferMode::BlindPlaceCall,
                    _ => TransferMode::Default,
                };
            }
            "rcd" => out.request_caller_details = parse_bool(value),
            "ac" => out.account_code = Some(value.to_string()),
            "rc" => out.rate_code = Some(value.to_string()),
            "dr" => {
                if let Ok(v) = value.parse::<u32>() {
                    out.reinvite_delay = CallDescriptor::clamp_reinvite_delay(v);
                }
            }
            "ir" => saw_ir = true,
            _ => {}
        }
    }

    if saw_ir {
        out.reinvite_delay = 2;
    }
    out
}

/// Inverse of `parse`, emitting only keys that differ from the default so a
/// round trip through `parse(unparse(x))` reproduces `x`.
pub fn unparse(options: &DialStringOptions) -> String {
    let defaults = DialStringOptions::default();
    let mut parts: Vec<String> = Vec::new();

    if options.delay_seconds != defaults.delay_seconds {
        parts.push(format!("dt={}", options.delay_seconds));
    }
    match options.redirect_mode {
        RedirectMode::NewDialPlan => parts.push("rm=n".to_string()),
        RedirectMode::Manual => parts.push("rm=m".to_string()),
        RedirectMode::None => {}
    }
    if let Some(cd) = options.call_duration_limit {
        parts.push(format!("cd={}", cd));
    }
    if options.mangle_response_sdp != defaults.mangle_response_sdp {
        parts.push(format!("ma={}", if options.mangle_response_sdp { 1 } else { 0 }));
    }
    if let Some(fd) = &options.from_display_name {
        parts.push(format!("fd={}", fd));
    }
    if let Some(fu) = &options.from_uri_user {
        parts.push(format!("fu={}", fu));
    }
    if let Some(fh) = &options.from_uri_host {
        parts.push(format!("fh={}", fh));
    }
    match options.transfer_mode {
        TransferMode::NotAllowed => parts.push("tr=n".to_string()),
        TransferMode::PassThrough => parts.push("tr=p".to_string()),
        TransferMode::BlindPlaceCall => parts.push("tr=c".to_string()),
        TransferMode::Default => {}
    }
    if options.request_caller_details {
        parts.push("rcd=1".to_string());
    }
    if let Some(ac) = &options.account_code {
        parts.push(format!("ac={}", ac));
    }
    if let Some(rc) = &options.rate_code {
        parts.push(format!("rc={}", rc));
    }
    if options.reinvite_delay != defaults.reinvite_delay {
        parts.push(format!("dr={}", options.reinvite_delay));
    }

    parts.join(";")
}

/// Apply parsed dial-string options onto an existing descriptor, the way a
/// dial-string suffix overrides a base `CallDescriptor`.
pub fn apply(descriptor: &mut CallDescriptor, options: &DialStringOptions) {
    descriptor.delay_seconds = options.delay_seconds;
    descriptor.redirect_mode = options.redirect_mode;
    descriptor.call_duration_limit = options.call_duration_limit.map(Duration::from_secs);
    descriptor.mangle_response_sdp = options.mangle_response_sdp;
    if options.from_display_name.is_some() {
        descriptor.from_display_name = options.from_display_name.clone();
    }
    if options.from_uri_user.is_some() {
        descriptor.from_uri_user = options.from_uri_user.clone();
    }
    if options.from_uri_host.is_some() {
        descriptor.from_uri_host = options.from_uri_host.clone();
    }
    descriptor.transfer_mode = options.transfer_mode;
    descriptor.request_caller_details = options.request_caller_details;
    if options.account_code.is_some() {
        descriptor.account_code = options.account_code.clone();
    }
    if options.rate_code.is_some() {
        descriptor.rate_code = options.rate_code.clone();
    }
    descriptor.reinvite_delay = options.reinvite_delay;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_unparse() {
        let mut opts = DialStringOptions::default();
        opts.delay_seconds = 5;
        opts.redirect_mode = RedirectMode::Manual;
        opts.call_duration_limit = Some(3600);
        opts.transfer_mode = TransferMode::PassThrough;
        opts.account_code = Some("ACC1".to_string());

        let serialized = unparse(&opts);
        let reparsed = parse(&serialized);
        assert_eq!(opts, reparsed);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let opts = parse("dt=3;bogus=xyz;rm=m");
        assert_eq!(opts.delay_seconds, 3);
        assert_eq!(opts.redirect_mode, RedirectMode::Manual);
    }

    #[test]
    fn legacy_ir_switch_forces_reinvite_delay_two() {
        let opts = parse("dr=5;ir=1");
        assert_eq!(opts.reinvite_delay, 2);
    }

    #[test]
    fn reinvite_delay_key_is_clamped() {
        let opts = parse("dr=99");
        assert_eq!(opts.reinvite_delay, crate::descriptor::MAX_REINVITE_DELAY);
    }
}
