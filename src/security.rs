// src/security.rs

//! Allow-list validators for caller-supplied names, versions and paths
//!
//! Every action that builds a command line from recipe fragments, or that
//! writes, reads or links a path derived from recipe input, checks it here
//! first. The predicates are deliberately narrow: anything outside the
//! allowed charset is rejected rather than escaped.

use crate::error::{Error, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Characters that carry meaning to a shell
const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '<', '>', '\n', '\r', ' ', '\t',
];

/// Characters rejected in bare command names
const COMMAND_METACHARACTERS: &str = "|&;$`\"'<>(){}[]!*?~";

fn starts_with_letter(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
}

fn starts_with_digit(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_ascii_digit())
}

fn all_chars(s: &str, allowed: impl Fn(char) -> bool) -> bool {
    s.chars().all(allowed)
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn is_semver_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '+'
}

// =============================================================================
// Identifier validators
// =============================================================================

/// RubyGems name: letter first, then `[A-Za-z0-9_-]`, at most 100 chars
pub fn is_valid_gem_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 100 && starts_with_letter(name) && all_chars(name, is_name_char)
}

/// crates.io name: letter first, then `[A-Za-z0-9_-]`, at most 64 chars
pub fn is_valid_crate_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 64 && starts_with_letter(name) && all_chars(name, is_name_char)
}

/// npm package name, including scoped names (`@scope/pkg`)
///
/// npm's own rules are loose; this rejects anything a shell would interpret.
pub fn is_valid_npm_package(name: &str) -> bool {
    !name.is_empty() && name.len() <= 214 && !name.contains(SHELL_METACHARACTERS) && !name.contains("..")
}

/// PyPI project name: alphanumeric first, then `[A-Za-z0-9._-]`, at most 200 chars
pub fn is_valid_pypi_package(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 200
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && all_chars(name, |c| is_name_char(c) || c == '.')
        && !name.contains("..")
}

/// Go module path: `domain/path`, letter first, no `//` or `..`, at most 256 chars
pub fn is_valid_go_module(path: &str) -> bool {
    !path.is_empty()
        && path.len() <= 256
        && path.contains('/')
        && starts_with_letter(path)
        && all_chars(path, |c| is_name_char(c) || c == '/' || c == '.')
        && !path.contains("//")
        && !path.contains("..")
}

/// Bare command name looked up on PATH
pub fn is_valid_command_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains(['/', '\\'])
        && !name.contains(|c: char| COMMAND_METACHARACTERS.contains(c))
        && !name.chars().any(|c| c <= ' ' || c == '\x7f')
        && name != "."
        && name != ".."
}

/// Library name used to build `libs/<name>-<version>` paths
pub fn is_valid_library_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 100 && starts_with_letter(name) && all_chars(name, |c| is_name_char(c) || c == '.') && !name.contains("..")
}

/// Tool name used to build `tools/<name>-<version>` paths
pub fn is_valid_tool_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 100
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && all_chars(name, |c| is_name_char(c) || c == '.')
        && !name.contains("..")
}

/// System package name passed to a distribution package manager
pub fn is_valid_system_package(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && all_chars(name, |c| is_name_char(c) || matches!(c, '.' | '+' | ':' | '@'))
}

/// Argument passed through to a build configuration script
///
/// Flags such as `--with-ssl=/path` are fine; shell syntax is not.
pub fn is_valid_configure_arg(arg: &str) -> bool {
    !arg.is_empty() && arg.len() <= 500 && !arg.contains(SHELL_METACHARACTERS) && !arg.contains(['"', '\'', '\\'])
}

// =============================================================================
// Version validators
// =============================================================================

/// Semver-like version (cargo, installed tool versions): digit first, `[A-Za-z0-9.+-]`
pub fn is_valid_cargo_version(version: &str) -> bool {
    !version.is_empty() && version.len() <= 50 && starts_with_digit(version) && all_chars(version, is_semver_char)
}

/// RubyGems version: digit first, `[A-Za-z0-9.-]`
pub fn is_valid_gem_version(version: &str) -> bool {
    !version.is_empty()
        && version.len() <= 50
        && starts_with_digit(version)
        && all_chars(version, |c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

/// PyPI normalized version: digit first, lowercase letters open a release tag
/// (`1.0rc1`, `2.0.0a3`) and no dot may follow once a tag has started
pub fn is_valid_pypi_version(version: &str) -> bool {
    if version.is_empty() || version.len() > 50 || !starts_with_digit(version) {
        return false;
    }

    let mut in_release = false;
    for c in version.chars().skip(1) {
        match c {
            '0'..='9' => {}
            '.' if in_release => return false,
            '.' => {}
            'a'..='z' => in_release = true,
            _ => return false,
        }
    }
    true
}

/// Go module version: empty or `latest`, otherwise `v` or digit first
pub fn is_valid_go_version(version: &str) -> bool {
    if version.is_empty() || version == "latest" {
        return true;
    }
    version.len() <= 50
        && (version.starts_with('v') || starts_with_digit(version))
        && all_chars(version, is_semver_char)
}

/// npm version or range fragment usable after `@`
pub fn is_valid_npm_version(version: &str) -> bool {
    !version.is_empty()
        && version.len() <= 50
        && all_chars(version, |c| is_semver_char(c) || matches!(c, '^' | '~' | '*' | 'x'))
}

/// Dependency version in a `name@version` declaration
pub fn is_valid_dependency_version(version: &str) -> bool {
    version == "latest" || is_valid_cargo_version(version.trim_start_matches('v'))
}

/// Version as it appears in an install directory name
///
/// Looser than the ecosystem validators (tags such as `v1.2` or
/// `2024-01-05` are fine) but never a path separator or `..`.
pub fn is_valid_install_version(version: &str) -> bool {
    !version.is_empty()
        && version.len() <= 100
        && version.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && all_chars(version, |c| is_name_char(c) || matches!(c, '.' | '+' | '~'))
        && !version.contains("..")
}

/// Check the name and version that become `<name>-<version>` under the home
pub fn validate_install_id(name: &str, version: &str) -> Result<()> {
    if !is_valid_tool_name(name) {
        return Err(Error::InvalidPath(format!("invalid tool name: '{}'", name)));
    }
    if !is_valid_install_version(version) {
        return Err(Error::InvalidPath(format!(
            "invalid version for {}: '{}'",
            name, version
        )));
    }
    Ok(())
}

// =============================================================================
// Path validators
// =============================================================================

/// Validate a relative sub-path that must stay inside its parent directory
///
/// Rejects absolute paths and any `..` component. Returns the path with `.`
/// components removed.
pub fn validate_relative_path(path: &str) -> Result<PathBuf> {
    if path.is_empty() {
        return Err(Error::InvalidPath("empty path".to_string()));
    }
    let candidate = Path::new(path);
    if candidate.is_absolute() || path.starts_with('/') || path.starts_with('\\') {
        return Err(Error::PathTraversal(format!("absolute path not allowed: {}", path)));
    }

    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(c) => normalized.push(c),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(Error::PathTraversal(format!("'..' not allowed: {}", path)));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(Error::PathTraversal(format!("absolute path not allowed: {}", path)));
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(Error::InvalidPath(format!("path resolves to nothing: {}", path)));
    }
    Ok(normalized)
}

/// Join a validated relative path onto a root
pub fn safe_join(root: &Path, path: &str) -> Result<PathBuf> {
    Ok(root.join(validate_relative_path(path)?))
}

/// Lexically normalize a path, resolving `.` and `..` without touching the filesystem
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // ".." at the root stays at the root
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// True if `target` is `base` or lies beneath it, compared lexically
pub fn is_path_within(target: &Path, base: &Path) -> bool {
    normalize_path(target).starts_with(normalize_path(base))
}

/// Relative path that leads from directory `from` to `to`
///
/// Both are normalized lexically first; neither has to exist.
pub fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from = normalize_path(from);
    let to = normalize_path(to);
    let from_parts: Vec<Component<'_>> = from.components().collect();
    let to_parts: Vec<Component<'_>> = to.components().collect();
    let common = from_parts
        .iter()
        .zip(&to_parts)
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..from_parts.len() {
        out.push("..");
    }
    for part in &to_parts[common..] {
        out.push(part.as_os_str());
    }
    out
}

/// Validate a symlink target before creating or copying the link
///
/// Absolute targets are always rejected. Relative targets are resolved
/// against the directory that will contain the link, and must stay inside
/// `root`.
pub fn validate_symlink_target(target: &Path, link_location: &Path, root: &Path) -> Result<()> {
    if target.is_absolute() {
        return Err(Error::PathTraversal(format!(
            "absolute symlink targets are not allowed: {} -> {}",
            link_location.display(),
            target.display()
        )));
    }

    let parent = link_location.parent().unwrap_or(Path::new(""));
    let resolved = normalize_path(&parent.join(target));
    if !is_path_within(&resolved, root) {
        return Err(Error::PathTraversal(format!(
            "symlink target escapes {}: {} -> {} (resolves to {})",
            root.display(),
            link_location.display(),
            target.display(),
            resolved.display()
        )));
    }
    Ok(())
}

/// Resolve a relative symlink target against what is actually on disk
///
/// `link_dir` is the canonical directory that holds the link. Symlinks met
/// along the way are followed, and `..` is only honored while the path so
/// far exists, so a chain of links that each look harmless on their own
/// cannot climb out of `root`. Returns the resolved location.
pub fn resolve_symlink_target(target: &Path, link_dir: &Path, root: &Path) -> Result<PathBuf> {
    let escape = || {
        Error::PathTraversal(format!(
            "symlink target escapes {}: {} (from {})",
            root.display(),
            target.display(),
            link_dir.display()
        ))
    };
    if !link_dir.starts_with(root) {
        return Err(escape());
    }

    let mut current = link_dir.to_path_buf();
    let mut on_disk = true;
    for component in target.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !on_disk || !current.pop() || !current.starts_with(root) {
                    return Err(escape());
                }
            }
            Component::Normal(part) => {
                current.push(part);
                if on_disk {
                    match fs::symlink_metadata(&current) {
                        Ok(meta) if meta.file_type().is_symlink() => match fs::canonicalize(&current) {
                            Ok(real) => current = real,
                            Err(_) => on_disk = false,
                        },
                        Ok(_) => {}
                        Err(_) => on_disk = false,
                    }
                }
                if !current.starts_with(root) {
                    return Err(escape());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(escape()),
        }
    }
    Ok(current)
}
