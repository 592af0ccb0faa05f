use super::Module;
use std::{
    borrow::Borrow,
    collections::{HashMap, HashSet},
};

/// Orders modules so that each one follows its dependencies and `run_after`
/// hints
///
/// References to unregistered modules are ignored. Among modules that are
/// ready at the same time, registration order wins. If the constraints form a
/// cycle, the modules on it are appended in registration order.
pub(super) fn startup_order<M>(modules: &[M]) -> Vec<String>
where
    M: Borrow<Module>,
{
    let index = modules
        .iter()
        .enumerate()
        .map(|(i, m)| (m.borrow().name(), i))
        .collect::<HashMap<_, _>>();

    // For each module, the set of modules that must precede it.
    let mut blocked_by = modules
        .iter()
        .map(|m| {
            let m = m.borrow();
            m.dependencies()
                .iter()
                .chain(m.run_after_hints())
                .filter_map(|name| index.get(name.as_str()).copied())
                .filter(|&i| modules[i].borrow().name() != m.name())
                .collect::<HashSet<_>>()
        })
        .collect::<Vec<_>>();

    let mut placed = vec![false; modules.len()];
    let mut order = Vec::with_capacity(modules.len());
    while order.len() < modules.len() {
        let Some(next) = (0..modules.len()).find(|&i| !placed[i] && blocked_by[i].is_empty())
        else {
            let cycle = (0..modules.len())
                .filter(|&i| !placed[i])
                .map(|i| modules[i].borrow().name())
                .collect::<Vec<_>>();
            tracing::warn!(?cycle, "Plugin ordering constraints form a cycle");
            for (i, m) in modules.iter().enumerate() {
                if !placed[i] {
                    order.push(m.borrow().name().to_string());
                }
            }
            break;
        };

        placed[next] = true;
        order.push(modules[next].borrow().name().to_string());
        for blockers in blocked_by.iter_mut() {
            blockers.remove(&next);
        }
    }

    order
}
