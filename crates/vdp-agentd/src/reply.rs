//! lldptool VDP reply parsing
//!
//! Two reply layouts are in use depending on the lldpad release:
//!
//! ```text
//! mode = assoc                   mode=assoc,mgrid2=0,typeid=0,...,uuid=<id>,filter=3003-fa:16:3e:00:00:01-100
//! uuid = <id>
//! filter = 3003-fa:16:3e:00:00:01-100
//! ```
//!
//! Either way the VSI must be echoed back in associated mode with exactly
//! one filter whose first token is the granted VLAN.

use crate::types::is_valid_vlan;

/// Result of an association attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AssocReply {
    pub vlan: Option<u16>,
    pub fail_reason: Option<String>,
}

impl AssocReply {
    pub fn granted(vlan: u16) -> Self {
        Self {
            vlan: Some(vlan),
            fail_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            vlan: None,
            fail_reason: Some(reason.into()),
        }
    }
}

fn key_values(reply: &str) -> Vec<(String, String)> {
    let lines: Vec<&str> = reply
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    // Legacy: everything on one comma separated line
    let fields: Vec<&str> = if lines.len() == 1 && lines[0].contains(',') {
        lines[0].split(',').collect()
    } else {
        lines
    };

    fields
        .into_iter()
        .filter_map(|f| f.split_once('='))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect()
}

/// Extracts the granted VLAN for `vsi_id` from an lldptool reply.
pub fn parse_assoc_reply(reply: &str, vsi_id: &str) -> AssocReply {
    if reply.trim().is_empty() {
        return AssocReply::failed("empty reply from lldpad");
    }
    let fields = key_values(reply);

    let echoes_vsi = fields
        .iter()
        .any(|(k, v)| k == "uuid" && v.eq_ignore_ascii_case(vsi_id));
    if !echoes_vsi {
        return AssocReply::failed(format!("reply does not carry VSI {}", vsi_id));
    }

    match fields.iter().find(|(k, _)| k == "mode").map(|(_, v)| v.as_str()) {
        Some("assoc") => {}
        Some(mode) => return AssocReply::failed(format!("switch answered mode {}", mode)),
        None => return AssocReply::failed("reply has no mode"),
    }

    let filters: Vec<&str> = fields
        .iter()
        .filter(|(k, _)| k == "filter")
        .map(|(_, v)| v.as_str())
        .collect();
    let filter = match filters.as_slice() {
        [one] => *one,
        [] => return AssocReply::failed("reply has no filter"),
        _ => {
            return AssocReply::failed(format!(
                "ambiguous reply with {} filters",
                filters.len()
            ))
        }
    };

    let token = filter.split('-').next().unwrap_or_default();
    match token.parse::<u16>() {
        Ok(vlan) if is_valid_vlan(vlan) => AssocReply::granted(vlan),
        _ => AssocReply::failed(format!("invalid VLAN '{}' in filter {}", token, filter)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const VSI: &str = "0b7bd1a8-4ae1-4b13-9f12-0f0e3e6f2a11";

    #[test]
    fn test_current_format() {
        let reply = format!(
            "mode = assoc\nmgrid2 = 0\ntypeid = 0\ntypeidver = 0\nuuid = {}\nhints = none\nfilter = 3003-fa:16:3e:00:00:01-100\n",
            VSI
        );
        assert_eq!(parse_assoc_reply(&reply, VSI), AssocReply::granted(3003));
    }

    #[test]
    fn test_legacy_format() {
        let reply = format!(
            "mode=assoc,mgrid2=0,typeid=0,typeidver=0,uuid={},hints=none,filter=3010-fa:16:3e:00:00:01-100",
            VSI
        );
        assert_eq!(parse_assoc_reply(&reply, VSI), AssocReply::granted(3010));
    }

    #[test]
    fn test_vlan_only_filter() {
        let reply = format!("mode = assoc\nuuid = {}\nfilter = 42\n", VSI);
        assert_eq!(parse_assoc_reply(&reply, VSI), AssocReply::granted(42));
    }

    #[test]
    fn test_rejections() {
        let deassoc = format!("mode = deassoc\nuuid = {}\nfilter = 0-fa:16:3e:00:00:01-100\n", VSI);
        let reply = parse_assoc_reply(&deassoc, VSI);
        assert_eq!(reply.vlan, None);
        assert!(reply.fail_reason.unwrap().contains("deassoc"));

        let other_vsi = "mode = assoc\nuuid = 11111111-2222-3333-4444-555555555555\nfilter = 3003\n";
        assert_eq!(parse_assoc_reply(other_vsi, VSI).vlan, None);

        assert_eq!(parse_assoc_reply("", VSI).vlan, None);
    }

    #[test]
    fn test_ambiguous_filters() {
        let reply = format!("mode = assoc\nuuid = {}\nfilter = 3003\nfilter = 3004\n", VSI);
        let parsed = parse_assoc_reply(&reply, VSI);
        assert_eq!(parsed.vlan, None);
        assert!(parsed.fail_reason.unwrap().contains("ambiguous"));

        let legacy = format!("mode=assoc,uuid={},filter=3003,filter=3004", VSI);
        assert_eq!(parse_assoc_reply(&legacy, VSI).vlan, None);
    }

    #[test]
    fn test_out_of_range_vlan() {
        for vlan in ["0", "4095", "abc"] {
            let reply = format!("mode = assoc\nuuid = {}\nfilter = {}-fa:16:3e:00:00:01\n", VSI, vlan);
            assert_eq!(parse_assoc_reply(&reply, VSI).vlan, None, "vlan {}", vlan);
        }
    }
}
