/// Structural patch protocol between two immutable state snapshots.
///
/// A patch set is an ordered list of add/replace/remove edits at a path,
/// shaped like the patches the peer's draft runtime emits:
/// `{"op": "replace", "path": ["rows", 0, "label"], "value": "x"}`.
/// Applying `diff(a, b)` to `a` yields a value structurally equal to `b`.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AnnotatorError, Result};

/// One step into a JSON document: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathSegment::Key(key) => write!(f, "{key}"),
            PathSegment::Index(index) => write!(f, "{index}"),
        }
    }
}

/// A single structural edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add {
        path: Vec<PathSegment>,
        value: Value,
    },
    Replace {
        path: Vec<PathSegment>,
        value: Value,
    },
    Remove {
        path: Vec<PathSegment>,
    },
}

impl PatchOp {
    pub fn path(&self) -> &[PathSegment] {
        match self {
            PatchOp::Add { path, .. } | PatchOp::Replace { path, .. } | PatchOp::Remove { path } => {
                path
            }
        }
    }
}

fn path_string(path: &[PathSegment]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for segment in path {
        out.push('/');
        out.push_str(&segment.to_string());
    }
    out
}

/// Compute the minimal ordered patch set transforming `a` into `b`.
///
/// Objects diff per key (additions and changes in key order, then
/// removals), arrays diff common indices and then grow or shrink the tail,
/// and any other difference replaces the whole subtree. The output is
/// deterministic for a given pair of snapshots.
pub fn diff(a: &Value, b: &Value) -> Vec<PatchOp> {
    let mut patches = Vec::new();
    let mut path = Vec::new();
    diff_at(a, b, &mut path, &mut patches);
    patches
}

fn diff_at(a: &Value, b: &Value, path: &mut Vec<PathSegment>, out: &mut Vec<PatchOp>) {
    match (a, b) {
        (Value::Object(ma), Value::Object(mb)) => {
            for (key, vb) in mb {
                match ma.get(key) {
                    Some(va) if va != vb => {
                        path.push(PathSegment::Key(key.clone()));
                        diff_at(va, vb, path, out);
                        path.pop();
                    }
                    Some(_) => {}
                    None => {
                        let mut child = path.clone();
                        child.push(PathSegment::Key(key.clone()));
                        out.push(PatchOp::Add {
                            path: child,
                            value: vb.clone(),
                        });
                    }
                }
            }
            for key in ma.keys() {
                if !mb.contains_key(key) {
                    let mut child = path.clone();
                    child.push(PathSegment::Key(key.clone()));
                    out.push(PatchOp::Remove { path: child });
                }
            }
        }
        (Value::Array(va), Value::Array(vb)) => {
            let common = va.len().min(vb.len());
            for index in 0..common {
                if va[index] != vb[index] {
                    path.push(PathSegment::Index(index));
                    diff_at(&va[index], &vb[index], path, out);
                    path.pop();
                }
            }
            for (index, value) in vb.iter().enumerate().skip(common) {
                let mut child = path.clone();
                child.push(PathSegment::Index(index));
                out.push(PatchOp::Add {
                    path: child,
                    value: value.clone(),
                });
            }
            // Shrink from the end so earlier indices stay valid while the
            // patch set is applied sequentially.
            for index in (common..va.len()).rev() {
                let mut child = path.clone();
                child.push(PathSegment::Index(index));
                out.push(PatchOp::Remove { path: child });
            }
        }
        _ => {
            if a != b {
                out.push(PatchOp::Replace {
                    path: path.clone(),
                    value: b.clone(),
                });
            }
        }
    }
}

/// Apply a patch set to a snapshot, producing the new root value.
///
/// The input snapshot is never modified; on failure the error names the
/// offending path and the caller's value is left as it was.
pub fn apply(state: &Value, patches: &[PatchOp]) -> Result<Value> {
    let mut next = state.clone();
    for op in patches {
        apply_one(&mut next, op)?;
    }
    Ok(next)
}

fn apply_one(root: &mut Value, op: &PatchOp) -> Result<()> {
    let path = op.path();

    // Whole-document edits have no parent to navigate to.
    if path.is_empty() {
        return match op {
            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                *root = value.clone();
                Ok(())
            }
            PatchOp::Remove { .. } => Err(AnnotatorError::EmptyPath),
        };
    }

    let (last, parents) = path.split_last().ok_or(AnnotatorError::EmptyPath)?;
    let parent = locate(root, parents)?;

    match (op, last) {
        (PatchOp::Add { value, .. }, PathSegment::Key(key)) => {
            let map = parent
                .as_object_mut()
                .ok_or_else(|| AnnotatorError::NotAContainer(path_string(parents)))?;
            map.insert(key.clone(), value.clone());
            Ok(())
        }
        (PatchOp::Add { value, .. }, PathSegment::Index(index)) => {
            let items = parent
                .as_array_mut()
                .ok_or_else(|| AnnotatorError::NotAContainer(path_string(parents)))?;
            if *index > items.len() {
                return Err(AnnotatorError::IndexOutOfBounds {
                    path: path_string(path),
                    index: *index,
                    len: items.len(),
                });
            }
            items.insert(*index, value.clone());
            Ok(())
        }
        (PatchOp::Replace { value, .. }, _) => {
            let target = locate(parent, std::slice::from_ref(last))?;
            *target = value.clone();
            Ok(())
        }
        (PatchOp::Remove { .. }, PathSegment::Key(key)) => {
            let map = parent
                .as_object_mut()
                .ok_or_else(|| AnnotatorError::NotAContainer(path_string(parents)))?;
            map.remove(key)
                .map(|_| ())
                .ok_or_else(|| AnnotatorError::PathNotFound(path_string(path)))
        }
        (PatchOp::Remove { .. }, PathSegment::Index(index)) => {
            let items = parent
                .as_array_mut()
                .ok_or_else(|| AnnotatorError::NotAContainer(path_string(parents)))?;
            if *index >= items.len() {
                return Err(AnnotatorError::IndexOutOfBounds {
                    path: path_string(path),
                    index: *index,
                    len: items.len(),
                });
            }
            items.remove(*index);
            Ok(())
        }
    }
}

fn locate<'a>(root: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value> {
    let mut current = root;
    for (depth, segment) in path.iter().enumerate() {
        current = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map
                .get_mut(key)
                .ok_or_else(|| AnnotatorError::PathNotFound(path_string(&path[..=depth])))?,
            (PathSegment::Index(index), Value::Array(items)) => {
                let len = items.len();
                items
                    .get_mut(*index)
                    .ok_or(AnnotatorError::IndexOutOfBounds {
                        path: path_string(&path[..=depth]),
                        index: *index,
                        len,
                    })?
            }
            (_, _) => return Err(AnnotatorError::NotAContainer(path_string(&path[..depth]))),
        };
    }
    Ok(current)
}
