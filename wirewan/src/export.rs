// Script export

//! RouterOS script rendering of a desired state
//!
//! The script first removes everything carrying the ownership tag (NAT first,
//! interface last) and then adds the desired resources menu by menu, so it can
//! be pasted into a terminal any number of times.

use crate::descriptor::{Category, DeviceState, Fields, OWNERSHIP_NAMESPACE};
use std::fmt::Write;

fn quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-/,:*".contains(c));
    if plain {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

fn add_command(fields: &Fields) -> String {
    let mut line = String::from("add");
    for (key, value) in fields {
        let _ = write!(line, " {}={}", key, quote(value));
    }
    line
}

/// Render `state` as a RouterOS script
pub fn routeros_script(state: &DeviceState) -> String {
    let mut script = String::new();
    let _ = writeln!(script, "# Generated by wirewan; resources tagged {}", OWNERSHIP_NAMESPACE);

    for category in Category::ALL.iter().rev() {
        let _ = writeln!(script, "{}", category.menu());
        let _ = writeln!(
            script,
            "remove [find where comment~\"^{}:\"]",
            OWNERSHIP_NAMESPACE
        );
    }

    let descriptors = state.descriptors();
    for category in Category::ALL {
        let lines: Vec<String> = descriptors
            .iter()
            .filter(|d| d.category() == category)
            .map(|d| add_command(&d.fields()))
            .collect();
        if lines.is_empty() {
            continue;
        }
        let _ = writeln!(script, "{}", category.menu());
        for line in lines {
            let _ = writeln!(script, "{}", line);
        }
    }
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{InterfaceDescriptor, OwnershipTag, RouteDescriptor};

    #[test]
    fn test_quote() {
        assert_eq!(quote("wg-corp"), "wg-corp");
        assert_eq!(quote("10.0.0.2/32,192.168.2.0/24"), "10.0.0.2/32,192.168.2.0/24");
        assert_eq!(quote("abc+def="), "\"abc+def=\"");
        assert_eq!(quote("say \"hi\" $x"), "\"say \\\"hi\\\" \\$x\"");
        assert_eq!(quote(""), "\"\"");
    }

    #[test]
    fn test_script_layout() {
        let state = DeviceState {
            interfaces: vec![InterfaceDescriptor {
                id: None,
                name: "wg-corp".into(),
                listen_port: 51820,
                private_key: Some("key+material=".into()),
                running: None,
                tag: OwnershipTag::new("iface-1"),
            }],
            routes: vec![RouteDescriptor {
                id: None,
                dst_address: "192.168.2.0/24".parse().unwrap(),
                gateway: "wg-corp".into(),
                tag: OwnershipTag::new("route-2"),
            }],
            ..Default::default()
        };
        let script = routeros_script(&state);
        let lines: Vec<&str> = script.lines().collect();

        // Six removal blocks, NAT first
        assert_eq!(lines[1], "/ip firewall nat");
        assert_eq!(lines[11], "/interface wireguard");
        assert!(lines[12].starts_with("remove [find where comment~"));

        assert_eq!(lines[13], "/interface wireguard");
        assert_eq!(
            lines[14],
            "add comment=WAN-Overlay-Manager:iface-1 listen-port=51820 name=wg-corp private-key=\"key+material=\""
        );
        assert_eq!(lines[15], "/ip route");
        assert!(lines[16].contains("dst-address=192.168.2.0/24"));
        assert_eq!(lines.len(), 17);
    }
}
