//! Service unit definitions
//!
//! `ServiceUnitSpec` is the typed form of the supervisor unit the provisioner
//! installs. This module renders it to the systemd unit format, parses a unit
//! back into a service definition, and writes it atomically.
//!
//! # Rendered layout
//!
//! ```text
//! [Unit]
//! Description=<description>
//! After=<after_target>
//!
//! [Service]
//! User=<run_user>
//! Group=<run_group>
//! WorkingDirectory=<working_directory>
//! Environment="KEY=VALUE"        (one line per variable, sorted by key)
//! ExecStart=<exec_command>
//!
//! [Install]
//! WantedBy=<wanted_by>
//! ```
//!
//! `%` is escaped as `%%` on render so supervisor specifier expansion never
//! changes a configured value.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{ProvisionError, Result};

/// Default unit directory for locally installed services
pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

const DEFAULT_AFTER: &str = "network.target";
const DEFAULT_WANTED_BY: &str = "multi-user.target";

/// Typed process-supervisor unit definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUnitSpec {
    /// Unit stem, without the `.service` suffix
    pub name: String,
    pub description: String,
    pub working_directory: PathBuf,
    pub run_user: String,
    pub run_group: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Full command line, first word is the absolute executable path
    pub exec_command: String,
    #[serde(default = "default_after")]
    pub after_target: String,
    #[serde(default = "default_wanted_by")]
    pub wanted_by: String,
}

fn default_after() -> String {
    DEFAULT_AFTER.to_string()
}

fn default_wanted_by() -> String {
    DEFAULT_WANTED_BY.to_string()
}

impl ServiceUnitSpec {
    /// File name of the rendered unit (`<name>.service`)
    pub fn file_name(&self) -> String {
        format!("{}.service", self.name)
    }

    /// Full path of the unit inside `unit_dir`
    pub fn unit_path(&self, unit_dir: &Path) -> PathBuf {
        unit_dir.join(self.file_name())
    }

    /// Executable referenced by `ExecStart`, without supervisor prefixes
    pub fn exec_path(&self) -> Option<PathBuf> {
        let first = self.exec_command.split_whitespace().next()?;
        let trimmed = first.trim_start_matches(['-', '@', '+', '!', ':']);
        if trimmed.is_empty() {
            None
        } else {
            Some(PathBuf::from(trimmed))
        }
    }

    /// Check every field against what the unit format can represent
    pub fn validate(&self) -> Result<()> {
        let name = self.name.as_str();
        if name.is_empty() {
            return Err(ProvisionError::config("Service name must not be empty"));
        }
        if name.ends_with(".service") {
            return Err(ProvisionError::config(format!(
                "Service name '{}' must not include the .service suffix",
                name
            )));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | ':'))
        {
            return Err(ProvisionError::config(format!(
                "Service name '{}' contains characters not allowed in unit names",
                name
            )));
        }

        check_single_line("description", &self.description)?;
        check_single_line("run_user", &self.run_user)?;
        check_single_line("run_group", &self.run_group)?;
        check_single_line("after_target", &self.after_target)?;
        check_single_line("wanted_by", &self.wanted_by)?;
        check_single_line("exec_command", &self.exec_command)?;

        if self.run_user.is_empty() || self.run_group.is_empty() {
            return Err(ProvisionError::config("run_user and run_group must be set"));
        }
        if self.run_user == "root" {
            return Err(ProvisionError::config(
                "Application server must not run as root",
            ));
        }
        if self.after_target.is_empty() || self.wanted_by.is_empty() {
            return Err(ProvisionError::config(
                "after_target and wanted_by must be set",
            ));
        }

        let wd = self.working_directory.to_str().ok_or_else(|| {
            ProvisionError::config("working_directory contains invalid UTF-8")
        })?;
        check_single_line("working_directory", wd)?;
        if !self.working_directory.is_absolute() {
            return Err(ProvisionError::config(format!(
                "working_directory '{}' must be absolute",
                wd
            )));
        }

        match self.exec_path() {
            Some(path) if path.is_absolute() => {}
            _ => {
                return Err(ProvisionError::config(format!(
                    "exec_command '{}' must start with an absolute executable path",
                    self.exec_command
                )));
            }
        }

        for (key, value) in &self.environment {
            if !is_env_key(key) {
                return Err(ProvisionError::config(format!(
                    "Invalid environment variable name '{}'",
                    key
                )));
            }
            if value.contains('\n') || value.contains('\r') {
                return Err(ProvisionError::config(format!(
                    "Environment value for {} must be a single line",
                    key
                )));
            }
        }

        Ok(())
    }

    /// Render the unit file contents
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("[Unit]\n");
        push_kv(&mut out, "Description", &self.description);
        push_kv(&mut out, "After", &self.after_target);
        out.push('\n');

        out.push_str("[Service]\n");
        push_kv(&mut out, "User", &self.run_user);
        push_kv(&mut out, "Group", &self.run_group);
        push_kv(
            &mut out,
            "WorkingDirectory",
            &self.working_directory.display().to_string(),
        );
        for (key, value) in &self.environment {
            out.push_str("Environment=");
            out.push_str(&quote_env(key, value));
            out.push('\n');
        }
        push_kv(&mut out, "ExecStart", &self.exec_command);
        out.push('\n');

        out.push_str("[Install]\n");
        push_kv(&mut out, "WantedBy", &self.wanted_by);
        out
    }

    /// Parse unit file contents back into a service definition
    ///
    /// Keys outside the rendered layout are ignored. Repeated `After=` and
    /// `WantedBy=` values are joined with a space.
    pub fn parse(name: &str, content: &str) -> Result<Self> {
        let sections = parse_sections(content)?;

        let unit = sections.get("Unit");
        let service = sections
            .get("Service")
            .ok_or_else(|| ProvisionError::unit_parse("missing [Service] section"))?;
        let install = sections.get("Install");

        let required = |key: &str| -> Result<String> {
            single(service, key)
                .ok_or_else(|| ProvisionError::unit_parse(format!("missing {}= in [Service]", key)))
        };

        let mut environment = BTreeMap::new();
        for raw in service.get("Environment").into_iter().flatten() {
            for word in split_quoted(raw)? {
                let (key, value) = word.split_once('=').ok_or_else(|| {
                    ProvisionError::unit_parse(format!("Environment entry '{}' has no '='", word))
                })?;
                environment.insert(key.to_string(), value.to_string());
            }
        }

        Ok(Self {
            name: name.trim_end_matches(".service").to_string(),
            description: unit.and_then(|s| single(s, "Description")).unwrap_or_default(),
            working_directory: PathBuf::from(required("WorkingDirectory")?),
            run_user: required("User")?,
            run_group: required("Group")?,
            environment,
            exec_command: required("ExecStart")?,
            after_target: unit
                .and_then(|s| joined(s, "After"))
                .unwrap_or_else(default_after),
            wanted_by: install
                .and_then(|s| joined(s, "WantedBy"))
                .unwrap_or_else(default_wanted_by),
        })
    }

    /// Read and parse a unit file; the name comes from the file stem
    pub fn read_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ProvisionError::filesystem(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ProvisionError::unit_parse(format!("No unit name in {}", path.display())))?;
        Self::parse(name, &content)
    }

    /// Render and atomically install the unit into `unit_dir`
    ///
    /// The content goes to a hidden temp file in the same directory, is
    /// synced, then renamed over the final path, so a crash never leaves a
    /// half-written unit behind.
    pub fn write_atomic(&self, unit_dir: &Path) -> Result<PathBuf> {
        let final_path = self.unit_path(unit_dir);
        let tmp_path = unit_dir.join(format!(".{}.tmp", self.file_name()));
        let content = self.render();

        fs::create_dir_all(unit_dir).map_err(|e| fs_error("create", unit_dir, e))?;

        let write_tmp = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            set_unit_permissions(&file)
        };
        if let Err(e) = write_tmp() {
            let _ = fs::remove_file(&tmp_path);
            return Err(fs_error("write", &tmp_path, e));
        }

        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(fs_error("rename into", &final_path, e));
        }

        // Sync parent directory so the rename survives power loss
        if let Ok(dir) = fs::File::open(unit_dir) {
            let _ = dir.sync_all();
        }

        tracing::info!(path = %final_path.display(), bytes = content.len(), "Service unit written");
        Ok(final_path)
    }
}

#[cfg(unix)]
fn set_unit_permissions(file: &fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_unit_permissions(_file: &fs::File) -> std::io::Result<()> {
    Ok(())
}

fn fs_error(action: &str, path: &Path, e: std::io::Error) -> ProvisionError {
    let msg = format!("Failed to {} {}: {}", action, path.display(), e);
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        ProvisionError::permission(msg)
    } else {
        ProvisionError::filesystem(msg)
    }
}

fn check_single_line(field: &str, value: &str) -> Result<()> {
    if value.contains('\n') || value.contains('\r') {
        return Err(ProvisionError::config(format!("{} must be a single line", field)));
    }
    if value.trim() != value {
        return Err(ProvisionError::config(format!(
            "{} must not have leading or trailing whitespace",
            field
        )));
    }
    if value.ends_with('\\') {
        return Err(ProvisionError::config(format!(
            "{} must not end with a backslash (line continuation)",
            field
        )));
    }
    Ok(())
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn push_kv(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push('=');
    out.push_str(&escape_specifiers(value));
    out.push('\n');
}

fn escape_specifiers(value: &str) -> String {
    value.replace('%', "%%")
}

fn unescape_specifiers(value: &str) -> String {
    value.replace("%%", "%")
}

fn quote_env(key: &str, value: &str) -> String {
    let raw = format!("{}={}", key, value);
    let escaped = escape_specifiers(&raw)
        .replace('\\', "\\\\")
        .replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Split an `Environment=` value into words, honouring double quotes and
/// backslash escapes inside them
fn split_quoted(raw: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_word = false;
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_word = true;
            }
            '\\' if in_quotes => match chars.next() {
                Some(next) => current.push(next),
                None => return Err(ProvisionError::unit_parse("dangling escape in Environment=")),
            },
            c if c.is_whitespace() && !in_quotes => {
                if has_word {
                    words.push(std::mem::take(&mut current));
                    has_word = false;
                }
            }
            c => {
                current.push(c);
                has_word = true;
            }
        }
    }

    if in_quotes {
        return Err(ProvisionError::unit_parse("unterminated quote in Environment="));
    }
    if has_word {
        words.push(current);
    }
    Ok(words)
}

type Section = HashMap<String, Vec<String>>;

/// INI-style section parser; values keep their order per key
fn parse_sections(content: &str) -> Result<HashMap<String, Section>> {
    let mut sections: HashMap<String, Section> = HashMap::new();
    let mut current: Option<String> = None;

    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            let name = rest.strip_suffix(']').ok_or_else(|| {
                ProvisionError::unit_parse(format!("line {}: malformed section header", lineno + 1))
            })?;
            if sections.contains_key(name) {
                return Err(ProvisionError::unit_parse(format!(
                    "Section [{}] appears more than once",
                    name
                )));
            }
            sections.insert(name.to_string(), Section::new());
            current = Some(name.to_string());
            continue;
        }

        let Some(section) = current.as_ref().and_then(|n| sections.get_mut(n)) else {
            return Err(ProvisionError::unit_parse(format!(
                "line {}: setting outside of a section",
                lineno + 1
            )));
        };
        let Some((key, value)) = line.split_once('=') else {
            return Err(ProvisionError::unit_parse(format!(
                "line {}: expected Key=Value",
                lineno + 1
            )));
        };

        section
            .entry(key.trim().to_string())
            .or_default()
            .push(unescape_specifiers(value.trim()));
    }

    Ok(sections)
}

fn single(section: &Section, key: &str) -> Option<String> {
    section.get(key).and_then(|values| values.last().cloned())
}

fn joined(section: &Section, key: &str) -> Option<String> {
    let values = section.get(key)?;
    let parts: Vec<&str> = values
        .iter()
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_spec() -> ServiceUnitSpec {
        ServiceUnitSpec {
            name: "app".to_string(),
            description: "Application server".to_string(),
            working_directory: PathBuf::from("/srv/app"),
            run_user: "app".to_string(),
            run_group: "app".to_string(),
            environment: BTreeMap::from([("PYTHONPATH".to_string(), "/srv/app".to_string())]),
            exec_command: "/srv/app/venv/bin/serve --host 0.0.0.0 --port 8000".to_string(),
            after_target: "network.target".to_string(),
            wanted_by: "multi-user.target".to_string(),
        }
    }

    #[test]
    fn test_render_exact_exec_and_working_directory() {
        let rendered = app_spec().render();
        assert!(rendered
            .lines()
            .any(|l| l == "ExecStart=/srv/app/venv/bin/serve --host 0.0.0.0 --port 8000"));
        assert!(rendered.lines().any(|l| l == "WorkingDirectory=/srv/app"));
        assert!(rendered.lines().any(|l| l == "Environment=\"PYTHONPATH=/srv/app\""));
        assert!(rendered.starts_with("[Unit]\nDescription=Application server\nAfter=network.target\n"));
        assert!(rendered.ends_with("[Install]\nWantedBy=multi-user.target\n"));
    }

    #[test]
    fn test_parse_roundtrip() {
        let spec = app_spec();
        let parsed = ServiceUnitSpec::parse("app", &spec.render()).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn test_percent_and_quotes_survive_roundtrip() {
        let mut spec = app_spec();
        spec.description = "100% uptime".to_string();
        spec.environment
            .insert("GREETING".to_string(), "say \"hi\" \\ 50%".to_string());
        let rendered = spec.render();
        assert!(rendered.contains("Description=100%% uptime"));
        let parsed = ServiceUnitSpec::parse("app", &rendered).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn test_parse_handles_foreign_unit_layout() {
        let content = "\
# managed elsewhere
[Unit]
Description=gunicorn daemon
After=network.target
After=syslog.target

[Service]
User=ec2-user
Group=nginx
WorkingDirectory=/home/ec2-user/app
Environment=\"PYTHONPATH=/home/ec2-user/app\" DJANGO_DEBUG=0
Restart=always
ExecStart=/home/ec2-user/app/venv/bin/gunicorn --bind 0.0.0.0:8000 app.wsgi:application

[Install]
WantedBy=multi-user.target
";
        let spec = ServiceUnitSpec::parse("gunicorn.service", content).unwrap();
        assert_eq!(spec.name, "gunicorn");
        assert_eq!(spec.after_target, "network.target syslog.target");
        assert_eq!(spec.environment.len(), 2);
        assert_eq!(spec.environment["DJANGO_DEBUG"], "0");
        assert_eq!(spec.run_group, "nginx");
    }

    #[test]
    fn test_parse_rejects_missing_service_section() {
        let err = ServiceUnitSpec::parse("x", "[Unit]\nDescription=x\n").unwrap_err();
        assert!(matches!(err, ProvisionError::UnitParse(_)));
    }

    #[test]
    fn test_parse_rejects_duplicate_sections() {
        let content = "[Service]\nUser=a\n[Service]\nUser=b\n";
        assert!(ServiceUnitSpec::parse("x", content).is_err());
    }

    #[test]
    fn test_validate_rules() {
        assert!(app_spec().validate().is_ok());

        let mut spec = app_spec();
        spec.exec_command = "serve --port 8000".to_string();
        assert!(spec.validate().is_err());

        let mut spec = app_spec();
        spec.working_directory = PathBuf::from("srv/app");
        assert!(spec.validate().is_err());

        let mut spec = app_spec();
        spec.run_user = "root".to_string();
        assert!(spec.validate().is_err());

        let mut spec = app_spec();
        spec.name = "app.service".to_string();
        assert!(spec.validate().is_err());

        let mut spec = app_spec();
        spec.environment.insert("1BAD".to_string(), "x".to_string());
        assert!(spec.validate().is_err());

        let mut spec = app_spec();
        spec.description = "two\nlines".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_exec_path_strips_prefixes() {
        let mut spec = app_spec();
        spec.exec_command = "-/usr/bin/true --flag".to_string();
        assert_eq!(spec.exec_path(), Some(PathBuf::from("/usr/bin/true")));
    }

    #[test]
    fn test_write_atomic_replaces_existing_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let spec = app_spec();

        std::fs::write(dir.path().join("app.service"), "stale").unwrap();
        let path = spec.write_atomic(dir.path()).unwrap();

        assert_eq!(path, dir.path().join("app.service"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), spec.render());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        let reread = ServiceUnitSpec::read_from(&path).unwrap();
        assert_eq!(reread, spec);
    }

    #[test]
    fn test_write_atomic_into_file_path_is_filesystem_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();

        let err = app_spec().write_atomic(&blocker).unwrap_err();
        assert!(matches!(err, ProvisionError::Filesystem(_)));
    }
}
