//! `PostUp`/`PostDown` command handling.
//!
//! Third-party hook commands are never parsed: they are stored verbatim and
//! written verbatim, with at most an advisory tag describing what the
//! command looks like. Commands this system originates (exit-node NAT,
//! forwarding, MSS clamping) are stored as templates with parameters so
//! regeneration can re-render them.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookDirection {
    PreUp,
    PostUp,
    PreDown,
    PostDown,
}

impl HookDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookDirection::PreUp => "PreUp",
            HookDirection::PostUp => "PostUp",
            HookDirection::PreDown => "PreDown",
            HookDirection::PostDown => "PostDown",
        }
    }
}

impl FromStr for HookDirection {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PreUp" => Ok(HookDirection::PreUp),
            "PostUp" => Ok(HookDirection::PostUp),
            "PreDown" => Ok(HookDirection::PreDown),
            "PostDown" => Ok(HookDirection::PostDown),
            _ => Err("one of: PreUp, PostUp, PreDown, PostDown"),
        }
    }
}

impl fmt::Display for HookDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory classification of a foreign hook command. Never used to rewrite
/// the command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookTag {
    ForwardAccept,
    Masquerade,
    SysctlIpForward,
    MssClamp,
}

static FORWARD_ACCEPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"iptables\s+-[AD]\s+FORWARD\b.*-j\s+ACCEPT").unwrap());
static MASQUERADE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"iptables\s+-t\s+nat\s+-[AD]\s+POSTROUTING\b.*-j\s+MASQUERADE").unwrap());
static SYSCTL_FORWARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"sysctl\s+(-w\s+)?net\.ipv[46]\.(ip_forward|conf\.all\.forwarding)=1").unwrap());
static MSS_CLAMP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"--clamp-mss-to-pmtu|--set-mss\s+\d+").unwrap());

/// Best-effort tag for a foreign command.
pub fn tag_for(command: &str) -> Option<HookTag> {
    if MASQUERADE.is_match(command) {
        Some(HookTag::Masquerade)
    } else if FORWARD_ACCEPT.is_match(command) {
        Some(HookTag::ForwardAccept)
    } else if SYSCTL_FORWARD.is_match(command) {
        Some(HookTag::SysctlIpForward)
    } else if MSS_CLAMP.is_match(command) {
        Some(HookTag::MssClamp)
    } else {
        None
    }
}

/// A hook command this system originated. Parameterized so regeneration
/// rewrites it instead of copying stale text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "template", rename_all = "snake_case")]
pub enum HookTemplate {
    /// NAT for an exit node: masquerade VPN traffic out the WAN interface.
    ExitNat { wan_interface: String },
    /// Accept forwarded traffic on the WireGuard interface.
    ForwardAccept,
    /// Clamp TCP MSS to path MTU for forwarded flows.
    MssClamp,
}

impl HookTemplate {
    /// Renders the up direction of the template. `%i` is substituted by
    /// wg-quick with the interface name.
    pub fn render_up(&self) -> String {
        match self {
            HookTemplate::ExitNat { wan_interface } => format!(
                "iptables -A FORWARD -i %i -j ACCEPT; iptables -t nat -A POSTROUTING -o {wan_interface} -j MASQUERADE"
            ),
            HookTemplate::ForwardAccept => {
                "iptables -A FORWARD -i %i -j ACCEPT; iptables -A FORWARD -o %i -j ACCEPT".to_string()
            },
            HookTemplate::MssClamp => {
                "iptables -t mangle -A FORWARD -o %i -p tcp --tcp-flags SYN,RST SYN -j TCPMSS --clamp-mss-to-pmtu"
                    .to_string()
            },
        }
    }

    /// Renders the matching down direction (A swapped for D).
    pub fn render_down(&self) -> String {
        self.render_up().replace(" -A ", " -D ")
    }
}

/// Where a hook line's text comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HookSource {
    /// Foreign command: emitted exactly as stored.
    Verbatim {
        text: String,
        tag: Option<HookTag>,
    },
    /// System-originated command: re-rendered from parameters.
    Template(HookTemplate),
}

/// One hook line attached to an entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookCommand {
    pub direction: HookDirection,
    pub seq: i64,
    pub source: HookSource,
}

impl HookCommand {
    pub fn verbatim(direction: HookDirection, seq: i64, text: &str) -> Self {
        HookCommand {
            direction,
            seq,
            source: HookSource::Verbatim {
                tag: tag_for(text),
                text: text.to_string(),
            },
        }
    }

    pub fn template(direction: HookDirection, seq: i64, template: HookTemplate) -> Self {
        HookCommand {
            direction,
            seq,
            source: HookSource::Template(template),
        }
    }

    /// The shell text to write into a config file.
    pub fn render(&self) -> String {
        match &self.source {
            HookSource::Verbatim { text, .. } => text.clone(),
            HookSource::Template(template) => match self.direction {
                HookDirection::PreUp | HookDirection::PostUp => template.render_up(),
                HookDirection::PreDown | HookDirection::PostDown => template.render_down(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_commands_survive_verbatim() {
        let text = "ip rule add fwmark 51820 table 51820   # custom policy routing";
        let hook = HookCommand::verbatim(HookDirection::PostUp, 0, text);
        assert_eq!(hook.render(), text);
        assert!(matches!(
            hook.source,
            HookSource::Verbatim { tag: None, .. }
        ));
    }

    #[test]
    fn tags_recognize_common_shapes() {
        assert_eq!(
            tag_for("iptables -t nat -A POSTROUTING -o eth0 -j MASQUERADE"),
            Some(HookTag::Masquerade)
        );
        assert_eq!(
            tag_for("iptables -A FORWARD -i %i -j ACCEPT"),
            Some(HookTag::ForwardAccept)
        );
        assert_eq!(
            tag_for("sysctl -w net.ipv4.ip_forward=1"),
            Some(HookTag::SysctlIpForward)
        );
        assert_eq!(tag_for("echo hello"), None);
    }

    #[test]
    fn nat_template_renders_both_directions() {
        let up = HookCommand::template(
            HookDirection::PostUp,
            0,
            HookTemplate::ExitNat {
                wan_interface: "eth0".to_string(),
            },
        );
        let down = HookCommand::template(
            HookDirection::PostDown,
            0,
            HookTemplate::ExitNat {
                wan_interface: "eth0".to_string(),
            },
        );
        assert!(up.render().contains("-A POSTROUTING -o eth0 -j MASQUERADE"));
        assert!(down.render().contains("-D POSTROUTING -o eth0 -j MASQUERADE"));
    }
}
