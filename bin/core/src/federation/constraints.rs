//! Constraint matching, candidate ranking, and dynamic
//! resource conditioning for federated pool selection.

use std::collections::HashMap;

use armada_client::entities::{
  armada_timestamp,
  federation::{
    AllocationState, AllowExclusive, JobConstraints, PoolSnapshot,
  },
  job::TaskDescriptor,
};

/// Why a pool was rejected. Surfaced in blocked action details.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
  pub pool_id: String,
  pub reason: String,
}

/// Evaluates the constraint set against one pool snapshot.
pub fn admits(
  constraints: &JobConstraints,
  pool: &PoolSnapshot,
) -> Result<(), String> {
  fn allow(
    mode: AllowExclusive,
    has: bool,
    what: &str,
  ) -> Result<(), String> {
    match mode {
      AllowExclusive::Allow => Ok(()),
      AllowExclusive::Exclusive if has => Ok(()),
      AllowExclusive::Exclusive => {
        Err(format!("{what} required"))
      }
      AllowExclusive::Deny if !has => Ok(()),
      AllowExclusive::Deny => Err(format!("{what} forbidden")),
    }
  }

  allow(constraints.autoscale, pool.autoscale, "autoscale")?;
  allow(
    constraints.low_priority_nodes,
    pool.low_priority_nodes > 0,
    "low priority nodes",
  )?;
  if let Some(native) = constraints.native
    && native != pool.native
  {
    return Err(format!(
      "native mode mismatch (pool is {})",
      pool.native
    ));
  }
  if let Some(windows) = constraints.windows
    && windows != pool.windows
  {
    return Err("windows mismatch".to_string());
  }
  if let Some(location) = &constraints.location
    && !location.eq_ignore_ascii_case(&pool.location)
  {
    return Err(format!(
      "location {} != {location}",
      pool.location
    ));
  }
  if constraints.container_registries.private_docker_hub
    && !pool.private_docker_hub_login
  {
    return Err("no private docker hub login".to_string());
  }
  for registry in &constraints.container_registries.public {
    if !pool.registries.iter().any(|r| r == registry) {
      return Err(format!("registry {registry} unavailable"));
    }
  }
  if let Some(backlog) = &constraints.max_active_task_backlog {
    let slots = pool.schedulable_slots();
    let exceeded = if slots == 0 {
      pool.active_tasks > 0 || !backlog.autoscale_exempt
    } else {
      pool.active_tasks as f64 / slots as f64 > backlog.ratio
    };
    let exempt = backlog.autoscale_exempt
      && pool.autoscale
      && pool.allocation_state == AllocationState::Steady
      && (pool.idle_nodes + pool.running_nodes) == 0;
    if exceeded && !exempt {
      return Err(format!(
        "backlog {}/{slots} over ratio {}",
        pool.active_tasks, backlog.ratio
      ));
    }
  }
  if let Some(arm_id) = &constraints.custom_image_arm_id
    && pool.custom_image_arm_id.as_deref() != Some(arm_id)
  {
    return Err("custom image mismatch".to_string());
  }
  if let Some(arm_id) = &constraints.virtual_network_arm_id
    && pool.virtual_network_arm_id.as_deref() != Some(arm_id)
  {
    return Err("virtual network mismatch".to_string());
  }
  if let Some(vm_size) = &constraints.vm_size
    && !vm_size.eq_ignore_ascii_case(&pool.vm_size)
  {
    return Err(format!("vm size {} != {vm_size}", pool.vm_size));
  }
  if let Some(cores) = &constraints.cores
    && !cores.admits(pool.cores_per_node)
  {
    return Err(format!(
      "cores {} outside [{}, {}]",
      pool.cores_per_node,
      cores.amount,
      cores
        .schedulable_variance
        .map(|v| cores.amount * (1.0 + v))
        .unwrap_or(f64::INFINITY),
    ));
  }
  if let Some(memory) = &constraints.memory
    && !memory.admits(pool.memory_gb_per_node)
  {
    return Err(format!(
      "memory {}GB outside bounds",
      pool.memory_gb_per_node
    ));
  }
  if let Some(gpu) = constraints.gpu
    && gpu != pool.gpu
  {
    return Err("gpu capability mismatch".to_string());
  }
  if let Some(infiniband) = constraints.infiniband
    && infiniband != pool.infiniband
  {
    return Err("infiniband capability mismatch".to_string());
  }
  Ok(())
}

/// Matches and ranks candidate pools. Pools inside their
/// blackout window are excluded. Ranking prefers (a) lowest
/// backlog ratio, (b) the prior location of co-scheduled task
/// groups for the same job, (c) highest remaining quota, then
/// (d) lexicographic pool id for determinism.
pub fn select(
  constraints: &JobConstraints,
  snapshots: &[PoolSnapshot],
  prior_location: Option<&str>,
  blackout_until: &HashMap<String, i64>,
) -> (Vec<PoolSnapshot>, Vec<Rejection>) {
  let now = armada_timestamp();
  let mut rejections = Vec::new();
  let mut candidates: Vec<&PoolSnapshot> = Vec::new();
  for pool in snapshots {
    if let Some(&until) = blackout_until.get(&pool.pool_id)
      && until > now
    {
      rejections.push(Rejection {
        pool_id: pool.pool_id.clone(),
        reason: "in blackout window".to_string(),
      });
      continue;
    }
    match admits(constraints, pool) {
      Ok(()) => candidates.push(pool),
      Err(reason) => rejections.push(Rejection {
        pool_id: pool.pool_id.clone(),
        reason,
      }),
    }
  }

  candidates.sort_by(|a, b| {
    a.backlog_ratio()
      .partial_cmp(&b.backlog_ratio())
      .unwrap_or(std::cmp::Ordering::Equal)
      .then_with(|| {
        let a_prior = prior_location
          .map(|location| a.location == location)
          .unwrap_or(false);
        let b_prior = prior_location
          .map(|location| b.location == location)
          .unwrap_or(false);
        b_prior.cmp(&a_prior)
      })
      .then_with(|| b.remaining_quota.cmp(&a.remaining_quota))
      .then_with(|| a.pool_id.cmp(&b.pool_id))
  });

  (
    candidates.into_iter().cloned().collect(),
    rejections,
  )
}

/// Adjusts task descriptors to the selected pool: capability
/// flags the pool cannot honor are dropped, the exclusive
/// constraint rides onto every task, shm allocations clamp to
/// half the node memory, and environment hints record the
/// placement.
pub fn condition_tasks(
  tasks: &mut [TaskDescriptor],
  constraints: &JobConstraints,
  pool: &PoolSnapshot,
) {
  for task in tasks.iter_mut() {
    if constraints.exclusive {
      task.exclusive = true;
    }
    if task.gpu && !pool.gpu {
      debug!(
        "dropping gpu flag for task on non-gpu pool {}",
        pool.pool_id
      );
      task.gpu = false;
    }
    if task.infiniband && !pool.infiniband {
      debug!(
        "dropping infiniband flag for task on pool {}",
        pool.pool_id
      );
      task.infiniband = false;
    }
    if let Some(shm) = &task.shm_size
      && let Some(gb) = parse_size_gb(shm)
    {
      let cap = pool.memory_gb_per_node / 2.0;
      if gb > cap && cap > 0.0 {
        task.shm_size = Some(format!("{cap:.1}g"));
      }
    }
    task.environment.insert(
      "ARMADA_SELECTED_POOL".to_string(),
      pool.pool_id.clone(),
    );
    task.environment.insert(
      "ARMADA_POOL_LOCATION".to_string(),
      pool.location.clone(),
    );
    task.environment.insert(
      "ARMADA_MAX_TASKS_PER_NODE".to_string(),
      if constraints.exclusive {
        "1".to_string()
      } else {
        pool.max_tasks_per_node.to_string()
      },
    );
  }
}

/// Parses "4g" / "512m" style sizes into GB.
fn parse_size_gb(size: &str) -> Option<f64> {
  let size = size.trim().to_ascii_lowercase();
  let (number, unit) =
    size.split_at(size.len().saturating_sub(1));
  let value: f64 = number.parse().ok()?;
  match unit {
    "g" => Some(value),
    "m" => Some(value / 1024.0),
    _ => size.parse::<f64>().ok().map(|b| b / (1024.0 * 1024.0 * 1024.0)),
  }
}
