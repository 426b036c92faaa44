use std::collections::HashMap;

use crate::app::models::{DeviceFileEntry, DeviceState, DeviceSummary};

pub fn parse_adb_devices(output: &str) -> Vec<DeviceSummary> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let mut summary = DeviceSummary {
                serial: tokens[0].to_string(),
                state: DeviceState::from_token(tokens[1]),
                model: None,
                product: None,
                transport_id: None,
            };
            for token in tokens.iter().skip(2) {
                if let Some(value) = token.strip_prefix("model:") {
                    summary.model = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("product:") {
                    summary.product = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("transport_id:") {
                    summary.transport_id = Some(value.to_string());
                }
            }
            Some(summary)
        })
        .collect()
}

pub fn parse_getprop_map(output: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('[') {
            continue;
        }
        let Some((key_part, value_part)) = trimmed.split_once("]: [") else {
            continue;
        };
        let key = key_part.trim_start_matches('[').trim();
        let value = value_part.trim_end_matches(']').trim();
        if !key.is_empty() {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

pub fn parse_ls_la(path: &str, output: &str) -> Vec<DeviceFileEntry> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with("total"))
        .filter(|line| !is_missing_file_message(line))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 7 {
                return None;
            }
            let perm = tokens[0];
            let is_dir = perm.starts_with('d');
            let size_bytes = tokens.get(4).and_then(|value| value.parse::<u64>().ok());
            // toybox prints "YYYY-MM-DD HH:MM name"; busybox prints "Mon DD HH:MM name".
            let (modified_at, name_start_index) = if tokens.len() >= 9 && !tokens[5].contains('-') {
                (format!("{} {} {}", tokens[5], tokens[6], tokens[7]), 8usize)
            } else {
                (format!("{} {}", tokens[5], tokens[6]), 7usize)
            };
            let modified_at = Some(modified_at).filter(|value| !value.trim().is_empty());
            let name = if tokens.len() > name_start_index {
                tokens[name_start_index..].join(" ")
            } else {
                String::new()
            };
            if name.is_empty() || name == "." || name == ".." {
                return None;
            }
            // `ls -la <file>` echoes the full path as the name.
            let entry_path = if name.starts_with('/') {
                name.clone()
            } else {
                format!("{}/{}", path.trim_end_matches('/'), name)
            };
            let name = entry_path
                .rsplit('/')
                .next()
                .unwrap_or(name.as_str())
                .to_string();
            Some(DeviceFileEntry {
                name,
                path: entry_path,
                is_dir,
                size_bytes,
                modified_at,
            })
        })
        .collect()
}

pub fn is_missing_file_message(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered.contains("no such file") || lowered.contains("does not exist")
}

/// Result of checking a single remote file with `ls -la <path>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFileCheck {
    Missing,
    Present { size_bytes: u64 },
}

pub fn parse_remote_file_check(remote_path: &str, stdout: &str, stderr: &str) -> RemoteFileCheck {
    if is_missing_file_message(stdout) || is_missing_file_message(stderr) {
        return RemoteFileCheck::Missing;
    }
    let (dir, base) = split_device_path(remote_path);
    let entries = parse_ls_la(&dir, stdout);
    let entry = if entries.len() == 1 {
        entries.into_iter().next()
    } else {
        entries.into_iter().find(|entry| entry.name == base)
    };
    match entry {
        Some(entry) if !entry.is_dir => RemoteFileCheck::Present {
            size_bytes: entry.size_bytes.unwrap_or(0),
        },
        _ => RemoteFileCheck::Missing,
    }
}

pub fn split_device_path(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    if let Some((dir, base)) = trimmed.rsplit_once('/') {
        let dir = if dir.is_empty() {
            "/".to_string()
        } else {
            dir.to_string()
        };
        return (dir, base.to_string());
    }
    (".".to_string(), trimmed.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Failed(String),
}

/// `adb connect` exits 0 even on failure, so the text decides.
pub fn classify_connect_output(stdout: &str, stderr: &str) -> ConnectOutcome {
    let combined = format!("{stdout}{stderr}");
    let lowered = combined.to_lowercase();
    let negative = ["cannot connect", "failed", "unable", "refused", "no route"];
    if lowered.contains("connected") && !negative.iter().any(|word| lowered.contains(word)) {
        ConnectOutcome::Connected
    } else {
        ConnectOutcome::Failed(combined.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_all_states_when_parsing() {
        let output = "List of devices attached\nemulator-5554\tdevice\nR58M12345\tunauthorized\n";
        let parsed = parse_adb_devices(output);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].serial, "emulator-5554");
        assert_eq!(parsed[0].state, DeviceState::Device);
        assert_eq!(parsed[1].state, DeviceState::Unauthorized);
    }

    #[test]
    fn parses_long_listing_fields() {
        let output = "* daemon not running; starting now at tcp:5037\n* daemon started successfully\nList of devices attached\n0123456789ABCDEF device product:panther model:Pixel_7 device:panther transport_id:1\n192.168.1.20:5555 offline transport_id:3\n";
        let parsed = parse_adb_devices(output);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].model.as_deref(), Some("Pixel_7"));
        assert_eq!(parsed[0].transport_id.as_deref(), Some("1"));
        assert_eq!(parsed[1].state, DeviceState::Offline);
        assert!(parsed[1].is_network());
    }

    #[test]
    fn parses_getprop_map() {
        let output = "[vendor.audio.hal.dump.output]: [1]\n[ro.product.model]: [Pixel 7]\n";
        let map = parse_getprop_map(output);
        assert_eq!(map.get("vendor.audio.hal.dump.output").map(String::as_str), Some("1"));
        assert_eq!(map.get("ro.product.model").map(String::as_str), Some("Pixel 7"));
    }

    #[test]
    fn parses_directory_listing() {
        let output = "total 12\ndrwxr-xr-x 2 root root 4096 2024-01-01 12:00 .\n-rw-r--r-- 1 audioserver audio 384000 2024-01-01 12:00 out_primary.pcm\n-rw-r--r-- 1 audioserver audio 0 2024-01-01 12:01 in_mic.pcm\n";
        let entries = parse_ls_la("/data/vendor/audiohal/audio_dump/", output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "/data/vendor/audiohal/audio_dump/out_primary.pcm");
        assert_eq!(entries[0].size_bytes, Some(384000));
        assert_eq!(entries[1].size_bytes, Some(0));
    }

    #[test]
    fn checks_single_remote_file() {
        let stdout = "-rw-rw---- 1 root sdcard_rw 50000 2024-05-01 10:00 /sdcard/loopback_48000_2ch.wav\n";
        assert_eq!(
            parse_remote_file_check("/sdcard/loopback_48000_2ch.wav", stdout, ""),
            RemoteFileCheck::Present { size_bytes: 50000 }
        );
        assert_eq!(
            parse_remote_file_check(
                "/sdcard/loopback_48000_2ch.wav",
                "",
                "ls: /sdcard/loopback_48000_2ch.wav: No such file or directory"
            ),
            RemoteFileCheck::Missing
        );
    }

    #[test]
    fn busybox_style_dates_are_handled() {
        let stdout = "-rw-r--r--    1 root     root         2048 May  1 10:00 rec.wav\n";
        assert_eq!(
            parse_remote_file_check("/sdcard/rec.wav", stdout, ""),
            RemoteFileCheck::Present { size_bytes: 2048 }
        );
    }

    #[test]
    fn classifies_connect_output() {
        assert_eq!(
            classify_connect_output("connected to 192.168.1.20:5555\n", ""),
            ConnectOutcome::Connected
        );
        assert_eq!(
            classify_connect_output("already connected to 192.168.1.20:5555\n", ""),
            ConnectOutcome::Connected
        );
        assert_eq!(
            classify_connect_output("", "Connected to host"),
            ConnectOutcome::Connected
        );
        assert_eq!(
            classify_connect_output(
                "failed to connect to '10.0.0.9:5555': Connection refused\n",
                ""
            ),
            ConnectOutcome::Failed(
                "failed to connect to '10.0.0.9:5555': Connection refused".to_string()
            )
        );
        assert!(matches!(
            classify_connect_output("cannot connect to 10.0.0.9:5555", ""),
            ConnectOutcome::Failed(_)
        ));
    }
}
