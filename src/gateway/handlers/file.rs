//! File target handler
//!
//! Writes alarms either as one file per event or as an appended log,
//! depending on the directory/filename templates and `append_mode`.
//! Formats: JSON, CSV (optional header row), TXT (`default`/`syslog`),
//! XML with mandatory escaping. Filenames are sanitized, writes can be
//! atomic (temp → fsync → rename), oversized logs rotate, and old files
//! age out.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, warn};

use crate::gateway::template::{expand, TemplateVars};
use crate::types::{CspAlarmMessage, CspValueMessage, TargetSendResult};

use super::TargetHandler;

const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const FALLBACK_BASENAME: &str = "alarm";

/// Replace filesystem-hostile characters with `_`, collapsing runs to a
/// single `_`. An empty or fully-forbidden name falls back to a default.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_underscore = false;
    for ch in name.chars() {
        let mapped = if FORBIDDEN.contains(&ch) || ch.is_control() {
            '_'
        } else {
            ch
        };
        if mapped == '_' {
            if !last_was_underscore {
                out.push('_');
            }
            last_was_underscore = true;
        } else {
            out.push(mapped);
            last_was_underscore = false;
        }
    }
    let trimmed = out.trim_matches('_').to_string();
    if trimmed.is_empty() {
        FALLBACK_BASENAME.to_string()
    } else {
        trimmed
    }
}

pub struct FileTargetHandler;

impl FileTargetHandler {
    pub fn new() -> Self {
        Self
    }

    /// Format one alarm for the configured file format. Append mode gets a
    /// single line; whole-file mode may get the same content as a document.
    pub fn format_alarm(alarm: &CspAlarmMessage, config: &serde_json::Value) -> String {
        let format = config
            .get("file_format")
            .and_then(|v| v.as_str())
            .unwrap_or("json");
        match format {
            "csv" => csv_row(alarm),
            "txt" => {
                let text_format = config
                    .get("text_format")
                    .and_then(|v| v.as_str())
                    .unwrap_or("default");
                if text_format == "syslog" {
                    syslog_line(alarm)
                } else {
                    text_line(alarm)
                }
            }
            "xml" => xml_element(alarm),
            _ => serde_json::to_string(alarm).unwrap_or_default(),
        }
    }

    pub fn csv_header() -> &'static str {
        "bd,nm,vl,tm,al,st,des"
    }

    fn extension(config: &serde_json::Value) -> &str {
        match config.get("file_format").and_then(|v| v.as_str()) {
            Some("csv") => "csv",
            Some("txt") => "log",
            Some("xml") => "xml",
            _ => "json",
        }
    }

    fn resolve_path(
        alarm: &CspAlarmMessage,
        config: &serde_json::Value,
    ) -> Result<PathBuf, String> {
        let base = config
            .get("base_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "Missing base_path in FILE target config".to_string())?;

        let vars = TemplateVars::from_alarm(alarm);
        let mut path = PathBuf::from(base);

        if let Some(dir_template) = config.get("directory_template").and_then(|v| v.as_str()) {
            if !dir_template.is_empty() {
                for segment in expand(dir_template, &vars).split('/') {
                    if segment.is_empty() {
                        continue;
                    }
                    path.push(sanitize_filename(segment));
                }
            }
        }

        let default_name = format!(
            "{}_{}_{}.{}",
            FALLBACK_BASENAME,
            alarm.bd,
            vars.time.timestamp_millis(),
            Self::extension(config)
        );
        let file_template = config
            .get("filename_template")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty());
        let filename = match file_template {
            Some(template) => {
                let expanded = expand(template, &vars);
                // Sanitize the stem but keep a real extension separator.
                match expanded.rsplit_once('.') {
                    Some((stem, ext)) if !ext.is_empty() && !ext.contains(FORBIDDEN) => {
                        format!("{}.{}", sanitize_filename(stem), ext)
                    }
                    _ => sanitize_filename(&expanded),
                }
            }
            None => default_name,
        };
        path.push(filename);
        Ok(path)
    }

    fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
        let directory = path.parent().unwrap_or_else(|| Path::new("."));
        let temp_path = directory.join(format!(
            ".{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("out")
        ));
        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(content)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, path)
    }

    fn rotate_if_oversized(path: &Path, config: &serde_json::Value) {
        let Some(max_mb) = config.get("max_file_size_mb").and_then(|v| v.as_u64()) else {
            return;
        };
        if max_mb == 0 {
            return;
        }
        let Ok(metadata) = fs::metadata(path) else {
            return;
        };
        if metadata.len() < max_mb * 1024 * 1024 {
            return;
        }
        let rotated = path.with_extension(format!(
            "{}.{}",
            path.extension().and_then(|e| e.to_str()).unwrap_or("log"),
            Utc::now().format("%Y%m%d%H%M%S")
        ));
        if let Err(e) = fs::rename(path, &rotated) {
            warn!(path = %path.display(), error = %e, "Log rotation failed");
        } else {
            debug!(from = %path.display(), to = %rotated.display(), "Log rotated");
        }
    }

    fn cleanup_old_files(base: &Path, config: &serde_json::Value) {
        let Some(days) = config.get("auto_cleanup_days").and_then(|v| v.as_u64()) else {
            return;
        };
        if days == 0 {
            return;
        }
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(days * 24 * 3600);
        let Ok(entries) = fs::read_dir(base) else {
            return;
        };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                if modified < cutoff {
                    if let Err(e) = fs::remove_file(&path) {
                        warn!(path = %path.display(), error = %e, "Cleanup failed");
                    }
                }
            }
        }
    }

    #[cfg(unix)]
    fn apply_permissions(path: &Path, config: &serde_json::Value) {
        use std::os::unix::fs::PermissionsExt;
        let Some(mode) = config
            .get("file_permissions")
            .and_then(|v| v.as_str())
            .and_then(|s| u32::from_str_radix(s.trim_start_matches("0o"), 8).ok())
        else {
            return;
        };
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
            warn!(path = %path.display(), error = %e, "Could not set file permissions");
        }
    }

    #[cfg(not(unix))]
    fn apply_permissions(_path: &Path, _config: &serde_json::Value) {}

    fn write_alarm(
        alarm: &CspAlarmMessage,
        config: &serde_json::Value,
    ) -> Result<(PathBuf, usize), String> {
        let path = Self::resolve_path(alarm, config)?;
        let create_dirs = config
            .get("create_directories")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if create_dirs {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| format!("create dirs: {}", e))?;
            }
        }

        let append_mode = config
            .get("append_mode")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let line = Self::format_alarm(alarm, config);
        let written;

        if append_mode {
            Self::rotate_if_oversized(&path, config);

            let is_new = !path.exists();
            let mut content = String::new();
            if is_new
                && config.get("file_format").and_then(|v| v.as_str()) == Some("csv")
                && config
                    .get("csv_add_header")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
            {
                content.push_str(Self::csv_header());
                content.push('\n');
            }
            content.push_str(&line);
            content.push('\n');

            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| format!("open append: {}", e))?;
            file.write_all(content.as_bytes())
                .map_err(|e| format!("append: {}", e))?;
            written = content.len();
        } else {
            if path.exists()
                && config
                    .get("backup_on_overwrite")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
            {
                let backup = path.with_extension(format!(
                    "{}.bak",
                    path.extension().and_then(|e| e.to_str()).unwrap_or("out")
                ));
                let _ = fs::rename(&path, &backup);
            }

            let compressed = config
                .get("compression_enabled")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let atomic = config
                .get("atomic_write")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            let (final_path, bytes) = if compressed {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(line.as_bytes())
                    .map_err(|e| format!("gzip: {}", e))?;
                let data = encoder.finish().map_err(|e| format!("gzip: {}", e))?;
                let gz_path = path.with_extension(format!(
                    "{}.gz",
                    path.extension().and_then(|e| e.to_str()).unwrap_or("out")
                ));
                (gz_path, data)
            } else {
                (path.clone(), line.clone().into_bytes())
            };

            if atomic {
                Self::write_atomic(&final_path, &bytes).map_err(|e| format!("atomic write: {}", e))?;
            } else {
                fs::write(&final_path, &bytes).map_err(|e| format!("write: {}", e))?;
            }
            written = bytes.len();
            Self::apply_permissions(&final_path, config);
            if let Some(base) = config.get("base_path").and_then(|v| v.as_str()) {
                Self::cleanup_old_files(Path::new(base), config);
            }
            return Ok((final_path, written));
        }

        Self::apply_permissions(&path, config);
        if let Some(base) = config.get("base_path").and_then(|v| v.as_str()) {
            Self::cleanup_old_files(Path::new(base), config);
        }
        Ok((path, written))
    }
}

impl Default for FileTargetHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TargetHandler for FileTargetHandler {
    fn handler_type(&self) -> &'static str {
        "FILE"
    }

    async fn send_alarm(
        &self,
        alarm: &CspAlarmMessage,
        config: &serde_json::Value,
    ) -> TargetSendResult {
        let start = Instant::now();
        let mut result = TargetSendResult {
            target_type: "FILE".to_string(),
            ..TargetSendResult::default()
        };

        match Self::write_alarm(alarm, config) {
            Ok((path, written)) => {
                result.success = true;
                result.file_path = path.display().to_string();
                result.content_size = written;
            }
            Err(e) => result.error_message = e,
        }
        result.response_time_ms = start.elapsed().as_millis() as u64;
        result
    }

    async fn send_value(
        &self,
        value: &CspValueMessage,
        config: &serde_json::Value,
    ) -> TargetSendResult {
        // Values reuse the alarm path with al/st zeroed.
        let alarm = CspAlarmMessage {
            bd: value.bd,
            nm: value.nm.clone(),
            vl: value.vl,
            tm: value.tm.clone(),
            al: 0,
            st: 0,
            des: String::new(),
            point_id: value.point_id,
            site_id: value.site_id,
        };
        self.send_alarm(&alarm, config).await
    }

    async fn send_file(&self, local_path: &Path, config: &serde_json::Value) -> TargetSendResult {
        let start = Instant::now();
        let mut result = TargetSendResult {
            target_type: "FILE".to_string(),
            ..TargetSendResult::default()
        };
        let Some(base) = config.get("base_path").and_then(|v| v.as_str()) else {
            result.error_message = "Missing base_path in FILE target config".to_string();
            return result;
        };
        let Some(name) = local_path.file_name().and_then(|n| n.to_str()) else {
            result.error_message = format!("Invalid source path: {}", local_path.display());
            return result;
        };
        let dest = Path::new(base).join(sanitize_filename(name));
        match fs::create_dir_all(base).and_then(|_| fs::copy(local_path, &dest)) {
            Ok(bytes) => {
                result.success = true;
                result.file_path = dest.display().to_string();
                result.content_size = bytes as usize;
            }
            Err(e) => result.error_message = format!("file copy: {}", e),
        }
        result.response_time_ms = start.elapsed().as_millis() as u64;
        result
    }

    async fn test_connection(&self, config: &serde_json::Value) -> bool {
        let Some(base) = config.get("base_path").and_then(|v| v.as_str()) else {
            return false;
        };
        let probe = Path::new(base).join(".pulseone_probe");
        let ok = fs::create_dir_all(base).is_ok() && fs::write(&probe, b"probe").is_ok();
        let _ = fs::remove_file(&probe);
        ok
    }

    fn validate_config(&self, config: &serde_json::Value) -> Vec<String> {
        let mut errors = Vec::new();
        if config.get("base_path").and_then(|v| v.as_str()).is_none() {
            errors.push("base_path is required".to_string());
        }
        if let Some(format) = config.get("file_format").and_then(|v| v.as_str()) {
            if !matches!(format, "json" | "csv" | "txt" | "xml") {
                errors.push(format!("unsupported file_format '{}'", format));
            }
        }
        if let Some(text_format) = config.get("text_format").and_then(|v| v.as_str()) {
            if !matches!(text_format, "default" | "syslog") {
                errors.push(format!("unsupported text_format '{}'", text_format));
            }
        }
        if let Some(compression) = config.get("compression_format").and_then(|v| v.as_str()) {
            if !matches!(compression, "gzip" | "zip") {
                errors.push(format!("unsupported compression_format '{}'", compression));
            }
        }
        if let Some(mode) = config.get("file_permissions").and_then(|v| v.as_str()) {
            if u32::from_str_radix(mode.trim_start_matches("0o"), 8).is_err() {
                errors.push(format!("invalid file_permissions '{}'", mode));
            }
        }
        errors
    }
}

fn csv_quote(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn csv_row(alarm: &CspAlarmMessage) -> String {
    format!(
        "{},{},{},{},{},{},{}",
        alarm.bd,
        csv_quote(&alarm.nm),
        alarm.vl,
        csv_quote(&alarm.tm),
        alarm.al,
        alarm.st,
        csv_quote(&alarm.des),
    )
}

fn text_line(alarm: &CspAlarmMessage) -> String {
    format!(
        "[{}] building={} point={} value={} alarm={} state={} {}",
        alarm.tm, alarm.bd, alarm.nm, alarm.vl, alarm.al, alarm.st, alarm.des
    )
}

fn syslog_line(alarm: &CspAlarmMessage) -> String {
    // RFC 5424-ish, facility local0, severity warning.
    format!(
        "<132>1 {} pulseone gateway - - - building={} point={} value={} alarm={} {}",
        Utc::now().to_rfc3339(),
        alarm.bd,
        alarm.nm,
        alarm.vl,
        alarm.al,
        alarm.des
    )
}

fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn xml_element(alarm: &CspAlarmMessage) -> String {
    format!(
        "<alarm bd=\"{}\" nm=\"{}\" vl=\"{}\" tm=\"{}\" al=\"{}\" st=\"{}\">{}</alarm>",
        alarm.bd,
        xml_escape(&alarm.nm),
        alarm.vl,
        xml_escape(&alarm.tm),
        alarm.al,
        alarm.st,
        xml_escape(&alarm.des),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alarm(bd: i32, nm: &str) -> CspAlarmMessage {
        CspAlarmMessage::sample(bd, nm, 150.5, true)
    }

    #[test]
    fn sanitize_collapses_runs() {
        assert_eq!(sanitize_filename("A<>B"), "A_B");
        assert_eq!(sanitize_filename("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_filename("<>:*"), "alarm");
        assert_eq!(sanitize_filename(""), "alarm");
        assert_eq!(sanitize_filename("normal-name.log"), "normal-name.log");
    }

    #[test]
    fn csv_quotes_embedded_commas() {
        let mut a = alarm(101, "p,1");
        a.des = "said \"hi\"".to_string();
        let row = csv_row(&a);
        assert!(row.contains("\"p,1\""));
        assert!(row.contains("\"said \"\"hi\"\"\""));
    }

    #[test]
    fn xml_escapes_content() {
        let a = alarm(101, "a<b>");
        let xml = xml_element(&a);
        assert!(xml.contains("nm=\"a&lt;b&gt;\""));
    }

    #[tokio::test]
    async fn append_mode_accumulates_lines_in_one_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config = json!({
            "base_path": tmp.path().to_str().unwrap(),
            "file_format": "txt",
            "directory_template": "",
            "filename_template": "all_alarms.log",
            "append_mode": true,
        });
        let handler = FileTargetHandler::new();

        for bd in [101, 102, 103, 101, 104] {
            let result = handler.send_alarm(&alarm(bd, &format!("p{}", bd)), &config).await;
            assert!(result.success, "{}", result.error_message);
        }

        let content = fs::read_to_string(tmp.path().join("all_alarms.log")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].contains("building=101") && lines[0].contains("point=p101"));
        assert!(lines[4].contains("building=104") && lines[4].contains("point=p104"));
    }

    #[tokio::test]
    async fn csv_header_written_once() {
        let tmp = tempfile::tempdir().unwrap();
        let config = json!({
            "base_path": tmp.path().to_str().unwrap(),
            "file_format": "csv",
            "filename_template": "alarms.csv",
            "append_mode": true,
            "csv_add_header": true,
        });
        let handler = FileTargetHandler::new();
        handler.send_alarm(&alarm(101, "p1"), &config).await;
        handler.send_alarm(&alarm(102, "p2"), &config).await;

        let content = fs::read_to_string(tmp.path().join("alarms.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], FileTargetHandler::csv_header());
    }

    #[tokio::test]
    async fn atomic_write_produces_file_without_temp_leftover() {
        let tmp = tempfile::tempdir().unwrap();
        let config = json!({
            "base_path": tmp.path().to_str().unwrap(),
            "file_format": "json",
            "filename_template": "one.json",
            "atomic_write": true,
        });
        let handler = FileTargetHandler::new();
        let result = handler.send_alarm(&alarm(101, "p1"), &config).await;
        assert!(result.success);

        let entries: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["one.json"]);
    }

    #[tokio::test]
    async fn directory_template_expands_per_building() {
        let tmp = tempfile::tempdir().unwrap();
        let config = json!({
            "base_path": tmp.path().to_str().unwrap(),
            "file_format": "json",
            "directory_template": "building_{building_id}",
            "filename_template": "alarm.json",
        });
        let handler = FileTargetHandler::new();
        let result = handler.send_alarm(&alarm(101, "p1"), &config).await;
        assert!(result.success);
        assert!(tmp.path().join("building_101/alarm.json").exists());
    }

    #[tokio::test]
    async fn gzip_compression_writes_gz_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config = json!({
            "base_path": tmp.path().to_str().unwrap(),
            "file_format": "json",
            "filename_template": "one.json",
            "compression_enabled": true,
            "compression_format": "gzip",
        });
        let handler = FileTargetHandler::new();
        let result = handler.send_alarm(&alarm(101, "p1"), &config).await;
        assert!(result.success);
        assert!(result.file_path.ends_with("one.json.gz"));

        // Round-trip through the decoder to confirm the payload survived.
        let data = fs::read(&result.file_path).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(data.as_slice());
        let mut out = String::new();
        std::io::Read::read_to_string(&mut decoder, &mut out).unwrap();
        assert!(out.contains("\"bd\":101"));
    }

    #[tokio::test]
    async fn validation_and_probe() {
        let handler = FileTargetHandler::new();
        let errors = handler.validate_config(&json!({
            "file_format": "parquet",
            "text_format": "fancy",
            "file_permissions": "rw-r--r--",
        }));
        assert_eq!(errors.len(), 4); // + missing base_path

        let tmp = tempfile::tempdir().unwrap();
        assert!(
            handler
                .test_connection(&json!({"base_path": tmp.path().to_str().unwrap()}))
                .await
        );
    }
}
