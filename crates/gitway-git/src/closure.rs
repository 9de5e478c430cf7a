//! Object graph walks over the backend.

use crate::Result;
use gitway_storage::{ObjectId, Repository};
use std::collections::{HashSet, VecDeque};

/// Collects everything reachable from `roots`, not descending into `stop`.
///
/// Ids come back in discovery order, roots first. Objects the backend does
/// not know are still listed but contribute no links.
pub fn reachable(
    repo: &dyn Repository,
    roots: &[ObjectId],
    stop: &HashSet<ObjectId>,
) -> Result<Vec<ObjectId>> {
    let mut seen: HashSet<ObjectId> = HashSet::new();
    let mut queue: VecDeque<ObjectId> = VecDeque::new();
    let mut out = Vec::new();

    for root in roots {
        if !stop.contains(root) && seen.insert(*root) {
            queue.push_back(*root);
        }
    }
    while let Some(id) = queue.pop_front() {
        out.push(id);
        for link in repo.object_links(&id)? {
            if !stop.contains(&link) && seen.insert(link) {
                queue.push_back(link);
            }
        }
    }
    Ok(out)
}

/// Objects reachable from `wants` minus objects reachable from `haves`.
///
/// Haves the backend does not hold are ignored.
pub fn compute_closure(
    repo: &dyn Repository,
    wants: &[ObjectId],
    haves: &[ObjectId],
) -> Result<Vec<ObjectId>> {
    let mut known = Vec::with_capacity(haves.len());
    for have in haves {
        if repo.has_object(have)? {
            known.push(*have);
        }
    }
    let excluded: HashSet<ObjectId> = reachable(repo, &known, &HashSet::new())?
        .into_iter()
        .collect();
    reachable(repo, wants, &excluded)
}

/// True if `target` is `from` or reachable from it.
pub fn is_reachable_from(repo: &dyn Repository, target: &ObjectId, from: &[ObjectId]) -> Result<bool> {
    if from.contains(target) {
        return Ok(true);
    }
    Ok(reachable(repo, from, &HashSet::new())?.contains(target))
}

/// True if `ancestor` is in the commit history of `descendant`.
///
/// Walks parent links only.
pub fn is_ancestor(repo: &dyn Repository, ancestor: &ObjectId, descendant: &ObjectId) -> Result<bool> {
    let mut seen = HashSet::new();
    let mut stack = vec![*descendant];
    while let Some(id) = stack.pop() {
        if id == *ancestor {
            return Ok(true);
        }
        if !seen.insert(id) {
            continue;
        }
        if let Some(object) = repo.read_object(&id)? {
            stack.extend(object.parents()?);
        }
    }
    Ok(false)
}
