//! KL-020: Action decomposition — platform filtering, composite expansion,
//! and parameter substitution.
//!
//! Pure function of `(steps, platform, vars)`. Composites are expanded with
//! an explicit worklist; every work item carries the chain of composites that
//! produced it, and re-entering a composite already on the chain is a cycle.

use super::error::GenerationError;
use super::recipe::Step;
use super::template::{expand_value, TemplateVars};
use super::types::{Params, Platform, ResolvedStep};
use crate::actions::composite::{BuiltinComposites, CompositeExpander, ExpandError};
use crate::actions::ActionKind;
use tracing::{debug, warn};

/// Result of decomposing one recipe's steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decomposition {
    /// Primitive steps in execution order
    pub steps: Vec<ResolvedStep>,
    /// Step-scoped dependencies of steps that survived filtering
    pub step_dependencies: Vec<String>,
    /// Implicit dependencies required by the emitted primitives
    pub implicit_dependencies: Vec<String>,
    /// Host tools needed to perform generation
    pub eval_dependencies: Vec<String>,
}

fn push_unique(list: &mut Vec<String>, items: impl IntoIterator<Item = impl AsRef<str>>) {
    for item in items {
        let item = item.as_ref();
        if !list.iter().any(|x| x == item) {
            list.push(item.to_string());
        }
    }
}

/// Decomposes recipe steps using a composite catalog.
pub struct Decomposer<'a> {
    expander: &'a dyn CompositeExpander,
}

impl Default for Decomposer<'static> {
    fn default() -> Self {
        Self {
            expander: &BuiltinComposites,
        }
    }
}

struct WorkItem {
    action: String,
    params: Params,
    chain: Vec<ActionKind>,
}

impl<'a> Decomposer<'a> {
    pub fn new(expander: &'a dyn CompositeExpander) -> Self {
        Self { expander }
    }

    /// Filter, expand, and substitute `steps` for `platform`.
    pub fn decompose(
        &self,
        tool: &str,
        steps: &[Step],
        platform: &Platform,
        vars: &TemplateVars,
    ) -> Result<Decomposition, GenerationError> {
        let mut out = Decomposition::default();

        for (index, step) in steps.iter().enumerate() {
            let kind =
                ActionKind::from_name(&step.action).ok_or_else(|| GenerationError::UnknownAction {
                    tool: tool.to_string(),
                    step: index,
                    action: step.action.clone(),
                })?;

            if let Some(ref when) = step.when {
                if !when.matches(platform) {
                    debug!(tool, step = index, action = %kind, %platform, "step filtered by when-clause");
                    continue;
                }
            }
            if !kind.allowed_on(platform) {
                debug!(tool, step = index, action = %kind, %platform, "step filtered by action constraint");
                continue;
            }

            push_unique(&mut out.step_dependencies, &step.dependencies);
            let step_vars = mapped_vars(tool, index, step, vars)?;
            let mut params = step.params.clone();
            params.remove("os_mapping");
            params.remove("arch_mapping");

            self.expand_step(tool, index, step.action.clone(), params, platform, &step_vars, &mut out)?;
        }

        Ok(out)
    }

    fn expand_step(
        &self,
        tool: &str,
        index: usize,
        action: String,
        params: Params,
        platform: &Platform,
        vars: &TemplateVars,
        out: &mut Decomposition,
    ) -> Result<(), GenerationError> {
        let mut work = vec![WorkItem {
            action,
            params,
            chain: Vec::new(),
        }];

        while let Some(item) = work.pop() {
            let kind = ActionKind::from_name(&item.action).ok_or_else(|| {
                GenerationError::UnknownAction {
                    tool: tool.to_string(),
                    step: index,
                    action: item.action.clone(),
                }
            })?;
            let caps = kind.capabilities();
            push_unique(&mut out.eval_dependencies, caps.eval_dependencies);

            if caps.composite {
                if item.chain.contains(&kind) {
                    let mut chain: Vec<String> =
                        item.chain.iter().map(|k| k.name().to_string()).collect();
                    chain.push(kind.name().to_string());
                    return Err(GenerationError::DecompositionCycle {
                        tool: tool.to_string(),
                        step: index,
                        chain,
                    });
                }
                let children = self
                    .expander
                    .expand(kind, &item.params)
                    .map_err(|e| expand_error(tool, index, kind, e))?;
                let mut chain = item.chain;
                chain.push(kind);
                for child in children.into_iter().rev() {
                    work.push(WorkItem {
                        action: child.action,
                        params: child.params,
                        chain: chain.clone(),
                    });
                }
                continue;
            }

            if !kind.allowed_on(platform) {
                debug!(tool, step = index, action = %kind, "expanded primitive filtered by action constraint");
                continue;
            }

            let mut expanded = Params::new();
            for (key, value) in &item.params {
                let v = expand_value(value, vars).map_err(|source| GenerationError::Template {
                    tool: tool.to_string(),
                    step: index,
                    action: kind.name().to_string(),
                    source,
                })?;
                expanded.insert(key.clone(), v);
            }

            if !caps.evaluable {
                warn!(tool, step = index, action = %kind, "action is not evaluable; plan cannot fully reproduce it");
            }
            push_unique(&mut out.implicit_dependencies, caps.implicit_dependencies);
            out.steps.push(ResolvedStep {
                action: kind.name().to_string(),
                params: expanded,
                evaluable: caps.evaluable,
                deterministic: caps.deterministic,
                url: None,
                checksum: None,
                size: None,
            });
        }
        Ok(())
    }
}

fn expand_error(tool: &str, step: usize, kind: ActionKind, e: ExpandError) -> GenerationError {
    match e {
        ExpandError::MissingParam(param) => GenerationError::MissingParam {
            tool: tool.to_string(),
            step,
            action: kind.name().to_string(),
            param,
        },
        ExpandError::InvalidParam { param, reason } => GenerationError::InvalidParam {
            tool: tool.to_string(),
            step,
            action: kind.name().to_string(),
            param,
            reason,
        },
    }
}

/// Apply `os_mapping` / `arch_mapping` step params to the template vars.
fn mapped_vars(
    tool: &str,
    index: usize,
    step: &Step,
    vars: &TemplateVars,
) -> Result<TemplateVars, GenerationError> {
    let mut mapped = vars.clone();
    for (param, slot) in [("os_mapping", &mut mapped.os), ("arch_mapping", &mut mapped.arch)] {
        let Some(value) = step.params.get(param) else {
            continue;
        };
        let invalid = |reason: &str| GenerationError::InvalidParam {
            tool: tool.to_string(),
            step: index,
            action: step.action.clone(),
            param: param.to_string(),
            reason: reason.to_string(),
        };
        let table = value.as_object().ok_or_else(|| invalid("expected a table"))?;
        if let Some(renamed) = table.get(slot.as_str()) {
            *slot = renamed
                .as_str()
                .ok_or_else(|| invalid("values must be strings"))?
                .to_string();
        }
    }
    Ok(mapped)
}
