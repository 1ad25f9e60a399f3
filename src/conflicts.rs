use crate::dependency_graph::ReferenceGraph;
use crate::error::{Diagnostic, ScanError};
use crate::file_discovery::{slash_path, SourceFile};
use crate::symbol_indexer::Resolution;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

static NON_ALPHANUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9]").expect("Invalid normalization regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Every member holds code and is referenced: merging needs real work.
    Critical,
    Informational,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => f.write_str("critical"),
            Self::Informational => f.write_str("informational"),
        }
    }
}

/// One directory or module stem considered for a naming conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub path: PathBuf,
    pub file_count: usize,
    pub inbound: usize,
    pub non_empty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictMember {
    pub name: String,
    pub paths: Vec<PathBuf>,
    pub file_count: usize,
    pub inbound: usize,
    pub non_empty: bool,
}

impl ConflictMember {
    fn weight(&self) -> usize {
        self.file_count + self.inbound
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub key: String,
    pub members: Vec<ConflictMember>,
    pub suggested_primary: Option<String>,
    pub severity: Severity,
    pub ambiguous: bool,
    pub issue: String,
}

impl Conflict {
    pub fn member_names(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn diagnostic(&self) -> Option<Diagnostic> {
        self.ambiguous.then(|| {
            ScanError::AmbiguousConflict {
                key: self.key.clone(),
                members: self.members.iter().map(|m| m.name.clone()).collect(),
            }
            .into()
        })
    }
}

/// Lower-case, drop one trailing `s`, then drop everything that is not
/// a letter or digit.
pub fn normalize(name: &str) -> String {
    let lower = name.to_lowercase();
    let singular = lower.strip_suffix('s').unwrap_or(&lower);
    NON_ALPHANUMERIC.replace_all(singular, "").into_owned()
}

pub struct ConflictDetector<'a> {
    files: &'a [SourceFile],
    graph: &'a ReferenceGraph,
}

impl<'a> ConflictDetector<'a> {
    pub fn new(files: &'a [SourceFile], graph: &'a ReferenceGraph) -> Self {
        Self { files, graph }
    }

    pub fn detect(&self) -> Vec<Conflict> {
        detect_conflicts(self.candidates())
    }

    /// Every directory on the way to a file and every module stem.
    pub fn candidates(&self) -> Vec<Candidate> {
        let mut directories: BTreeSet<PathBuf> = BTreeSet::new();
        for file in self.files {
            let mut parent = file.relative_path.parent();
            while let Some(dir) = parent {
                if dir.as_os_str().is_empty() {
                    break;
                }
                directories.insert(dir.to_path_buf());
                parent = dir.parent();
            }
        }

        let mut candidates = Vec::new();

        for dir in directories {
            let Some(name) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let inside: Vec<&SourceFile> = self
                .files
                .iter()
                .filter(|f| f.relative_path.starts_with(&dir))
                .collect();
            candidates.push(Candidate {
                name,
                file_count: inside.len(),
                inbound: self.inbound_from_outside(|p| p.starts_with(&dir)),
                non_empty: inside.iter().any(|f| f.size > 0),
                path: dir,
            });
        }

        for file in self.files {
            let Some(stem) = file.relative_path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            if stem.starts_with("__") && stem.ends_with("__") {
                continue;
            }
            let path = file.relative_path.as_path();
            candidates.push(Candidate {
                name: stem,
                path: path.to_path_buf(),
                file_count: 1,
                inbound: self.inbound_from_outside(|p| p == path),
                non_empty: file.size > 0,
            });
        }

        candidates
    }

    fn inbound_from_outside(&self, inside: impl Fn(&Path) -> bool) -> usize {
        self.graph
            .references
            .iter()
            .filter(|r| r.resolution == Resolution::Resolved)
            .filter(|r| {
                r.target
                    .as_ref()
                    .map(|t| inside(&t.file) && !inside(&r.site_file))
                    .unwrap_or(false)
            })
            .count()
    }
}

/// Group candidates into conflicts. The result depends only on the set of
/// candidates, never on their order.
pub fn detect_conflicts(candidates: Vec<Candidate>) -> Vec<Conflict> {
    let mut by_name: BTreeMap<String, ConflictMember> = BTreeMap::new();
    for candidate in candidates {
        let member = by_name
            .entry(candidate.name.clone())
            .or_insert_with(|| ConflictMember {
                name: candidate.name.clone(),
                paths: Vec::new(),
                file_count: 0,
                inbound: 0,
                non_empty: false,
            });
        member.paths.push(candidate.path);
        member.file_count += candidate.file_count;
        member.inbound += candidate.inbound;
        member.non_empty |= candidate.non_empty;
    }

    let mut groups: BTreeMap<String, Vec<ConflictMember>> = BTreeMap::new();
    for (name, mut member) in by_name {
        let key = normalize(&name);
        if key.is_empty() {
            continue;
        }
        member.paths.sort();
        member.paths.dedup();
        groups.entry(key).or_default().push(member);
    }

    groups
        .into_iter()
        .filter(|(_, members)| members.len() >= 2)
        .map(|(key, members)| build_conflict(key, members))
        .collect()
}

fn build_conflict(key: String, members: Vec<ConflictMember>) -> Conflict {
    let ambiguous = members.len() >= 3;
    let suggested_primary = if ambiguous {
        None
    } else {
        members
            .iter()
            .min_by(|a, b| {
                b.weight()
                    .cmp(&a.weight())
                    .then_with(|| a.name.len().cmp(&b.name.len()))
                    .then_with(|| a.name.cmp(&b.name))
            })
            .map(|m| m.name.clone())
    };

    let severity = if members.iter().all(|m| m.non_empty && m.inbound > 0) {
        Severity::Critical
    } else {
        Severity::Informational
    };

    let listed: Vec<String> = members
        .iter()
        .map(|m| {
            let paths: Vec<String> = m.paths.iter().map(|p| slash_path(p)).collect();
            format!("{} ({})", m.name, paths.join(", "))
        })
        .collect();
    let issue = match &suggested_primary {
        Some(primary) => format!("similar names {}; consolidate into '{}'", listed.join(" vs "), primary),
        None => format!("{} names normalize to '{}': {}", members.len(), key, listed.join(" vs ")),
    };

    Conflict {
        key,
        members,
        suggested_primary,
        severity,
        ambiguous,
        issue,
    }
}
