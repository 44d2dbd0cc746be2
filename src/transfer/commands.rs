//! Shell command builders for channel transfers.
//!
//! Every path and payload is single-quoted with [`shell_quote`], so the
//! commands survive any file name the caller hands us.

use rand::Rng;

use crate::exec::shell_quote;

/// Line width used when a payload is streamed as a heredoc body.
pub const HEREDOC_LINE_WIDTH: usize = 76;

/// Upload a small payload with one inline command.
pub fn inline_upload(encoded: &str, path: &str) -> String {
    format!(
        "printf '%s' {} | base64 -d > {}",
        shell_quote(encoded),
        shell_quote(path)
    )
}

/// Upload a medium payload as a heredoc body terminated by `terminator`.
pub fn heredoc_upload(encoded: &str, path: &str, terminator: &str) -> String {
    let mut command = format!("base64 -d > {} << '{terminator}'\n", shell_quote(path));
    for line in encoded.as_bytes().chunks(HEREDOC_LINE_WIDTH) {
        command.push_str(&String::from_utf8_lossy(line));
        command.push('\n');
    }
    command.push_str(terminator);
    command
}

/// Random heredoc terminator that cannot occur in base64 output.
pub fn heredoc_terminator() -> String {
    format!("SR_EOF_{:08x}", rand::thread_rng().gen::<u32>())
}

/// Create or empty the staging file for chunked uploads.
pub fn truncate(path: &str) -> String {
    format!(": > {}", shell_quote(path))
}

pub fn append_chunk(chunk: &str, staging: &str) -> String {
    format!("printf '%s' {} >> {}", shell_quote(chunk), shell_quote(staging))
}

/// Decode the assembled staging file into place and drop the staging copy.
pub fn decode_staged(staging: &str, path: &str) -> String {
    format!(
        "base64 -d {} > {} && rm -f {}",
        shell_quote(staging),
        shell_quote(path),
        shell_quote(staging)
    )
}

pub fn remove(path: &str) -> String {
    format!("rm -f {}", shell_quote(path))
}

/// SHA-256 commands tried in order until one yields a digest.
pub fn checksum_commands(path: &str) -> [String; 3] {
    let quoted = shell_quote(path);
    [
        format!("sha256sum {quoted} 2>/dev/null | cut -d' ' -f1"),
        format!("shasum -a 256 {quoted} 2>/dev/null | cut -d' ' -f1"),
        format!("openssl dgst -sha256 {quoted} 2>/dev/null | awk '{{print $NF}}'"),
    ]
}

pub fn size(path: &str) -> String {
    format!("wc -c < {}", shell_quote(path))
}

/// Single-command base64 reads tried in order.
pub fn download_commands(path: &str) -> [String; 3] {
    let quoted = shell_quote(path);
    [
        format!("base64 -w 0 {quoted}"),
        format!("base64 {quoted} | tr -d '\\n'"),
        format!("openssl base64 -in {quoted} | tr -d '\\n'"),
    ]
}

/// Encode `path` into a remote staging file for position-addressed reads.
pub fn stage_download(path: &str, staging: &str) -> String {
    format!("base64 -w 0 {} > {}", shell_quote(path), shell_quote(staging))
}

/// Read `len` base64 characters starting at zero-based `offset`.
pub fn read_slice(staging: &str, offset: usize, len: usize) -> String {
    format!(
        "tail -c +{} {} | head -c {len}",
        offset + 1,
        shell_quote(staging)
    )
}

/// Hidden staging path under `dir`.
pub fn staging_path(dir: &str) -> String {
    let dir = dir.trim_end_matches('/');
    format!("{dir}/.sr_{:016x}.b64", rand::thread_rng().gen::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_upload_quotes_path_with_spaces() {
        assert_eq!(
            inline_upload("aGk=", "/tmp/my file"),
            "printf '%s' 'aGk=' | base64 -d > '/tmp/my file'"
        );
    }

    #[test]
    fn heredoc_wraps_lines_and_terminates() {
        let encoded = "A".repeat(200);
        let command = heredoc_upload(&encoded, "/tmp/x", "SR_EOF_1");
        let lines: Vec<&str> = command.lines().collect();
        assert_eq!(lines[0], "base64 -d > '/tmp/x' << 'SR_EOF_1'");
        assert_eq!(lines[1].len(), HEREDOC_LINE_WIDTH);
        assert_eq!(lines.last(), Some(&"SR_EOF_1"));
        assert_eq!(lines[1..lines.len() - 1].concat(), encoded);
    }

    #[test]
    fn slice_offsets_are_one_based_for_tail() {
        assert_eq!(
            read_slice("/tmp/.sr_1.b64", 0, 4000),
            "tail -c +1 '/tmp/.sr_1.b64' | head -c 4000"
        );
        assert!(read_slice("/t", 4000, 10).starts_with("tail -c +4001 "));
    }

    #[test]
    fn checksum_fallbacks_keep_order() {
        let commands = checksum_commands("/tmp/f");
        assert!(commands[0].starts_with("sha256sum "));
        assert!(commands[1].starts_with("shasum -a 256 "));
        assert!(commands[2].starts_with("openssl dgst -sha256 "));
    }

    #[test]
    fn staging_paths_are_unique_and_hidden() {
        let a = staging_path("/tmp/");
        let b = staging_path("/tmp");
        assert_ne!(a, b);
        assert!(a.starts_with("/tmp/.sr_") && a.ends_with(".b64"));
    }
}
