//! Planning and dependency-aware dispatch of plan entries.

use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;

use super::executor::execute_task;
use super::ledger::{QueryLog, TokenLedger};
use super::types::{Params, PlanEntry, RetryContextEntry, TaskOutput, TaskPlan, TurnContext};
use crate::agents::{CapabilityInvoker, Invocation};
use crate::capability::CapabilityRegistry;
use crate::config::WorkflowConfig;

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("planning capability failed: {0}")]
    Planning(String),

    #[error("plan is not well formed: {0}")]
    Malformed(String),

    #[error("task {task} depends on task {dependency}, which does not exist")]
    UnknownDependency { task: usize, dependency: usize },

    #[error("task {0} depends on itself")]
    SelfDependency(usize),

    #[error("task {0} is part of a dependency cycle")]
    Cycle(usize),
}

/// Order in which plan entries run: a list of groups, each group runnable
/// once every earlier group has finished.
///
/// Sequential scheduling yields single-entry groups in plan order whenever
/// dependencies allow it. Parallel scheduling groups entries by dependency
/// depth.
pub fn schedule(tasks: &[PlanEntry], parallel: bool) -> Result<Vec<Vec<usize>>, PlanError> {
    let n = tasks.len();
    for (task, entry) in tasks.iter().enumerate() {
        match entry.depends_on {
            Some(dependency) if dependency == task => return Err(PlanError::SelfDependency(task)),
            Some(dependency) if dependency >= n => {
                return Err(PlanError::UnknownDependency { task, dependency })
            }
            _ => {}
        }
    }

    let mut done = vec![false; n];
    let mut depth = vec![0usize; n];
    let mut order = Vec::with_capacity(n);
    while order.len() < n {
        let ready = (0..n).find(|&i| !done[i] && tasks[i].depends_on.map_or(true, |d| done[d]));
        let Some(next) = ready else {
            let stuck = (0..n).find(|&i| !done[i]).unwrap_or(0);
            return Err(PlanError::Cycle(stuck));
        };
        depth[next] = tasks[next].depends_on.map_or(0, |d| depth[d] + 1);
        done[next] = true;
        order.push(next);
    }

    if !parallel {
        return Ok(order.into_iter().map(|i| vec![i]).collect());
    }

    let levels = depth.iter().copied().max().map_or(0, |m| m + 1);
    Ok((0..levels)
        .map(|level| (0..n).filter(|&i| depth[i] == level).collect::<Vec<_>>())
        .filter(|group| !group.is_empty())
        .collect())
}

/// Produces a task plan and executes it.
pub struct Supervisor<'a> {
    invoker: &'a dyn CapabilityInvoker,
    registry: &'a CapabilityRegistry,
    settings: &'a WorkflowConfig,
}

impl<'a> Supervisor<'a> {
    pub fn new(
        invoker: &'a dyn CapabilityInvoker,
        registry: &'a CapabilityRegistry,
        settings: &'a WorkflowConfig,
    ) -> Self {
        Self {
            invoker,
            registry,
            settings,
        }
    }

    /// Plan and dispatch one attempt.
    ///
    /// Planning failures are absorbed: the attempt then has no task outputs.
    pub async fn plan_and_execute(
        &self,
        turn: &TurnContext,
        retry_context: &[RetryContextEntry],
        ledger: &mut TokenLedger,
        queries: &mut QueryLog,
    ) -> Vec<TaskOutput> {
        let plan = match self.plan(turn, retry_context, ledger).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(attempt = retry_context.len(), "Planning failed: {}", e);
                return Vec::new();
            }
        };

        match self.execute_plan(&plan, turn, ledger, queries).await {
            Ok(outputs) => outputs,
            Err(e) => {
                tracing::warn!("Plan could not be scheduled: {}", e);
                Vec::new()
            }
        }
    }

    /// Ask the planning capability for a task plan.
    ///
    /// Tokens are recorded even when the reply turns out unusable.
    pub async fn plan(
        &self,
        turn: &TurnContext,
        retry_context: &[RetryContextEntry],
        ledger: &mut TokenLedger,
    ) -> Result<TaskPlan, PlanError> {
        let planner = &self.registry.roles().planner;

        let mut vars = Params::new();
        let details = &turn.user_details;
        vars.insert(
            "user_name".to_string(),
            Value::String(details.user_name.clone().unwrap_or_default()),
        );
        vars.insert(
            "user_country".to_string(),
            Value::String(details.user_country.clone().unwrap_or_default()),
        );
        vars.insert("full_user_details".to_string(), details.to_value());
        vars.insert("user_input".to_string(), Value::String(turn.user_input.clone()));
        vars.insert(
            "conversation_history".to_string(),
            Value::String(turn.conversation_history.clone()),
        );
        vars.insert(
            "retry_context".to_string(),
            serde_json::to_value(retry_context).unwrap_or(Value::Array(Vec::new())),
        );
        vars.insert(
            "functions".to_string(),
            Value::String(self.registry.function_catalogue()),
        );

        let invocation = self
            .invoker
            .invoke(planner, &vars)
            .await
            .map_err(|e| PlanError::Planning(e.to_string()))?;
        ledger.record(invocation.usage);

        let plan: TaskPlan = serde_json::from_value(invocation.output)
            .map_err(|e| PlanError::Malformed(e.to_string()))?;
        schedule(&plan.tasks, false)?;

        tracing::info!(
            tasks = plan.tasks.len(),
            attempt = retry_context.len(),
            "Task plan ready: [{}]",
            plan.tasks
                .iter()
                .map(|t| t.capability.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(plan)
    }

    /// Execute every plan entry, never running an entry before its dependency.
    pub async fn execute_plan(
        &self,
        plan: &TaskPlan,
        turn: &TurnContext,
        ledger: &mut TokenLedger,
        queries: &mut QueryLog,
    ) -> Result<Vec<TaskOutput>, PlanError> {
        let groups = schedule(&plan.tasks, self.settings.parallel_tasks)?;
        let mut outputs: Vec<Option<TaskOutput>> = vec![None; plan.tasks.len()];

        for group in groups {
            let jobs: Vec<(usize, Params)> = group
                .into_iter()
                .map(|index| (index, self.resolve_params(&plan.tasks[index], &outputs, turn)))
                .collect();

            let results: Vec<(usize, Invocation)> = if jobs.len() > 1 {
                join_all(jobs.iter().map(|(index, params)| async move {
                    (*index, self.run_entry(&plan.tasks[*index], params).await)
                }))
                .await
            } else {
                let mut results = Vec::with_capacity(jobs.len());
                for (index, params) in &jobs {
                    results.push((*index, self.run_entry(&plan.tasks[*index], params).await));
                }
                results
            };

            for (index, invocation) in results {
                ledger.record(invocation.usage);
                queries.extend(invocation.queries);
                outputs[index] = Some(TaskOutput {
                    task_id: index,
                    capability: plan.tasks[index].capability.clone(),
                    output: invocation.output,
                });
            }
        }

        Ok(outputs.into_iter().flatten().collect())
    }

    async fn run_entry(&self, entry: &PlanEntry, params: &Params) -> Invocation {
        if !self.registry.is_enabled(&entry.capability) {
            tracing::warn!(capability = %entry.capability, "Plan selected a capability that is not enabled");
            return Invocation::empty();
        }
        execute_task(self.invoker, &entry.capability, params).await
    }

    /// Bind literal parameters positionally, then fill the dependency slot
    /// with the prior task's output.
    fn resolve_params(
        &self,
        entry: &PlanEntry,
        outputs: &[Option<TaskOutput>],
        turn: &TurnContext,
    ) -> Params {
        let spec = self.registry.get(&entry.capability).ok();
        let names: &[String] = spec.map(|s| s.parameters.as_slice()).unwrap_or(&[]);

        let mut params = Params::new();
        params.insert("question".to_string(), Value::String(entry.question.clone()));
        for (position, value) in entry.parameters.iter().enumerate() {
            match names.get(position) {
                Some(name) => {
                    params.insert(name.clone(), Value::String(value.clone()));
                }
                None => tracing::debug!(
                    capability = %entry.capability,
                    position,
                    "Ignoring surplus plan parameter"
                ),
            }
        }
        for name in names {
            params
                .entry(name.clone())
                .or_insert_with(|| Value::String(String::new()));
        }

        if let Some(dependency) = entry.depends_on {
            let slot = entry
                .bind_to
                .clone()
                .or_else(|| spec.map(|s| s.dependency_slot().to_string()))
                .unwrap_or_else(|| "input".to_string());
            let prior = outputs
                .get(dependency)
                .and_then(Option::as_ref)
                .map(|o| o.output.clone())
                .unwrap_or(Value::Null);
            params.insert(slot, prior);
        }

        params
            .entry("user_input".to_string())
            .or_insert_with(|| Value::String(turn.user_input.clone()));
        params
            .entry("conversation_history".to_string())
            .or_insert_with(|| Value::String(turn.conversation_history.clone()));
        params
            .entry("user_details".to_string())
            .or_insert_with(|| turn.user_details.to_value());
        params
    }
}
