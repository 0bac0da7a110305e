//! # Distributed Fit
//!
//! Runs one fit as an SPMD program: every rank executes [`rank_program`] on its own
//! thread against its own partition, in lock-step through the collective. Rank 0 runs on
//! the calling thread and additionally owns the [`ConvergenceController`]; the other ranks
//! only follow the decisions it broadcasts.

use crate::builder::{CoordinateState, NormalEquations, local_normal_equations};
use crate::collective::{CollectiveGroup, Communicator};
use crate::config::{Algorithm, FitOptions, RegularizationSpec, TrainingConfig};
use crate::controller::{ConvergenceController, Decision, FitState, FitStatus};
use crate::device::{DeviceMemoryPool, DeviceSet};
use crate::error::{FitError, FitWarning, root_cause};
use crate::model::{FittedModel, extract_model};
use crate::partition::{HostPartition, Partition, StagingPlan, stage};
use crate::progress::{FitProgressObserver, NoopFitProgress};
use crate::stats::{
    FeatureTransform, FirstPass, GlobalStatistics, local_centered_sums, local_sums,
};
use ndarray::Array1;
use std::sync::Arc;
use std::thread;

/// Aggregate facts about a finished fit.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub algorithm: Algorithm,
    pub iterations: usize,
    /// Objective value after every iteration, in the working space.
    pub objective_history: Vec<f64>,
    pub total_weight: f64,
    pub num_rows: usize,
    pub num_ranks: usize,
}

/// Everything a successful fit returns.
#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub model: FittedModel,
    pub status: FitStatus,
    pub warnings: Vec<FitWarning>,
    pub summary: TrainingSummary,
    /// States the controller passed through, `Init` to `Done`.
    pub states: Vec<FitState>,
}

/// Fits `config` on `partitions`, one rank per partition.
pub fn fit(partitions: Vec<HostPartition>, config: &TrainingConfig) -> Result<FitOutcome, FitError> {
    let controller = ConvergenceController::new(config)?;
    let group = CollectiveGroup::new(partitions.len());
    controller.fit(partitions, &group, &mut NoopFitProgress)
}

/// Checks that hold across partitions; each partition's own contract is checked too,
/// so a bad input fails before any thread starts.
fn validate_partitions(partitions: &[HostPartition], world_size: usize) -> Result<usize, FitError> {
    let Some(first) = partitions.first() else {
        return Err(FitError::InvalidConfig(
            "at least one partition is required".to_string(),
        ));
    };
    if world_size != partitions.len() {
        return Err(FitError::InvalidConfig(format!(
            "collective group has {world_size} ranks but {} partitions were supplied",
            partitions.len()
        )));
    }
    let num_features = first.ncols();
    for (rank, partition) in partitions.iter().enumerate() {
        if partition.ncols() != num_features {
            return Err(FitError::InvalidPartition {
                rank,
                reason: format!(
                    "{} features where rank 0 has {num_features}",
                    partition.ncols()
                ),
            });
        }
        partition.validate(rank)?;
    }
    Ok(num_features)
}

/// What rank 0 hands back once the ranks have finished.
struct LeaderResult {
    working: Array1<f64>,
    transform: FeatureTransform,
    status: FitStatus,
    iterations: usize,
    warnings: Vec<FitWarning>,
    total_weight: f64,
    num_rows: usize,
}

enum Role<'a> {
    Leader {
        controller: &'a mut ConvergenceController,
        observer: &'a mut dyn FitProgressObserver,
    },
    Follower,
}

impl Role<'_> {
    fn enter(&mut self, state: FitState) {
        if let Role::Leader {
            controller,
            observer,
        } = self
        {
            controller.enter(state, &mut **observer);
        }
    }

    /// Lets rank 0 decide and replicates the decision to every rank.
    fn decide(
        &mut self,
        comm: &Communicator,
        decide: impl FnOnce(&mut ConvergenceController, &mut dyn FitProgressObserver) -> Decision,
    ) -> Result<Decision, FitError> {
        let mut code = [0.0];
        if let Role::Leader {
            controller,
            observer,
        } = self
        {
            code[0] = decide(&mut **controller, &mut **observer).to_code();
        }
        comm.broadcast(&mut code)?;
        Decision::from_code(code[0]).ok_or_else(|| FitError::CollectiveFailure {
            rank: comm.rank(),
            reason: format!("unknown control decision {}", code[0]),
        })
    }
}

/// Inputs every rank shares.
#[derive(Clone, Copy)]
struct RankSetup {
    spec: RegularizationSpec,
    options: FitOptions,
    algorithm: Algorithm,
    plan: StagingPlan,
    num_features: usize,
}

pub(crate) fn execute(
    mut controller: ConvergenceController,
    partitions: Vec<HostPartition>,
    group: &CollectiveGroup,
    observer: &mut dyn FitProgressObserver,
) -> Result<FitOutcome, FitError> {
    let num_features = validate_partitions(&partitions, group.world_size())?;
    let setup = RankSetup {
        spec: *controller.spec(),
        options: *controller.options(),
        algorithm: controller.algorithm(),
        plan: StagingPlan {
            precision: controller.options().precision.storage,
            reserve_residuals: controller.algorithm() == Algorithm::CoordinateDescent,
        },
        num_features,
    };
    let devices = DeviceSet::from_layout(&setup.options.devices);
    let num_ranks = partitions.len();
    log::info!(
        "Fitting {num_features} features over {num_ranks} rank(s) on {} device(s) with {}",
        devices.len(),
        setup.algorithm
    );

    controller.begin(observer);
    let mut comms = group.connect().into_iter();
    let Some(root) = comms.next() else {
        return Err(FitError::InvalidConfig(
            "collective group has no ranks".to_string(),
        ));
    };

    let (leader, mut failures) = thread::scope(|scope| {
        let followers: Vec<_> = comms
            .zip(partitions.iter().skip(1))
            .map(|(comm, host)| {
                let rank = comm.rank();
                let pool = devices.device_for_rank(rank);
                let handle = scope.spawn(move || {
                    rank_program(Role::Follower, comm, host, &pool, setup)
                });
                (rank, handle)
            })
            .collect();

        let role = Role::Leader {
            controller: &mut controller,
            observer: &mut *observer,
        };
        let leader = rank_program(role, root, &partitions[0], &devices.device_for_rank(0), setup);

        let mut failures = Vec::new();
        for (rank, handle) in followers {
            match handle.join() {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => failures.push((rank, err)),
                Err(_) => failures.push((rank, FitError::RankPanicked { rank })),
            }
        }
        (leader, failures)
    });

    let result = match leader {
        Ok(result) => result,
        Err(err) => {
            failures.push((0, err));
            None
        }
    };
    if let Some(err) = root_cause(failures) {
        log::error!("Fit failed: {err}");
        return Err(err);
    }
    let Some(result) = result else {
        return Err(FitError::CollectiveFailure {
            rank: 0,
            reason: "rank 0 finished without a result".to_string(),
        });
    };

    let model = extract_model(
        &result.working,
        &result.transform,
        setup.spec.fit_intercept,
        result.iterations,
    );
    let (states, objective_history) = controller.into_trace();
    log::info!(
        "Fit {} after {} iteration(s); {} non-zero coefficient(s)",
        result.status,
        result.iterations,
        model.num_nonzero()
    );
    Ok(FitOutcome {
        model,
        status: result.status,
        warnings: result.warnings,
        summary: TrainingSummary {
            algorithm: setup.algorithm,
            iterations: result.iterations,
            objective_history,
            total_weight: result.total_weight,
            num_rows: result.num_rows,
            num_ranks,
        },
        states,
    })
}

fn zero_weight(rank: usize) -> FitError {
    FitError::InvalidPartition {
        rank,
        reason: "every row across all partitions has zero weight".to_string(),
    }
}

/// The program every rank runs. Only rank 0 returns a result.
fn rank_program(
    mut role: Role<'_>,
    comm: Communicator,
    host: &HostPartition,
    pool: &Arc<DeviceMemoryPool>,
    setup: RankSetup,
) -> Result<Option<LeaderResult>, FitError> {
    let rank = comm.rank();
    let partition = stage(host, rank, pool, &setup.plan)?;

    let (transform, totals) = if setup.spec.needs_statistics() {
        role.enter(FitState::BuildStats);
        let mut sums = local_sums(&partition);
        comm.all_reduce_sum(&mut sums)?;
        let first = FirstPass::from_reduced(&sums).ok_or_else(|| zero_weight(rank))?;
        let mut centered = local_centered_sums(&partition, &first);
        comm.all_reduce_sum(&mut centered)?;
        let stats = GlobalStatistics::from_passes(first, &centered);
        let totals = (stats.total_weight, stats.num_rows);
        (FeatureTransform::from_statistics(&stats, &setup.spec), Some(totals))
    } else {
        (FeatureTransform::identity(setup.num_features), None)
    };

    role.enter(FitState::Iterate);
    match setup.algorithm {
        Algorithm::DirectSolve => {
            direct_solve(role, &comm, &partition, transform, totals, setup)
        }
        Algorithm::CoordinateDescent => {
            coordinate_descent(role, &comm, &partition, transform, totals, setup)
        }
    }
}

fn direct_solve(
    mut role: Role<'_>,
    comm: &Communicator,
    partition: &Partition,
    transform: FeatureTransform,
    totals: Option<(f64, usize)>,
    setup: RankSetup,
) -> Result<Option<LeaderResult>, FitError> {
    let rank = comm.rank();
    match role.decide(comm, |controller, _| controller.control_point(0))? {
        Decision::Continue => {}
        Decision::Cancel => {
            return Err(FitError::Cancelled {
                completed_iterations: 0,
            });
        }
        Decision::Stop(status) => {
            let totals = global_totals(comm, partition, totals)?;
            let working = Array1::zeros(setup.num_features);
            return Ok(finish(role, working, transform, status, 0, Vec::new(), totals));
        }
    }

    let local = local_normal_equations(partition, &transform, setup.options.precision.accumulation);
    let mut buffer = local.to_buffer();
    comm.all_reduce_sum(&mut buffer)?;
    let total = NormalEquations::from_buffer(setup.num_features, &buffer).ok_or_else(|| {
        FitError::CollectiveFailure {
            rank,
            reason: "normal-equation buffer has the wrong length".to_string(),
        }
    })?;
    if !(total.total_weight > 0.0) {
        return Err(zero_weight(rank));
    }

    let mut beta = vec![0.0; setup.num_features];
    let mut warnings = Vec::new();
    if let Role::Leader {
        controller,
        observer,
    } = &mut role
    {
        let (solution, warning) = controller.solve_direct(&total, &transform, &mut **observer)?;
        beta = solution.to_vec();
        warnings.extend(warning);
    }
    comm.broadcast(&mut beta)?;

    let totals = (total.total_weight, total.num_rows.round() as usize);
    Ok(finish(
        role,
        Array1::from(beta),
        transform,
        FitStatus::DirectSolved,
        1,
        warnings,
        totals,
    ))
}

fn coordinate_descent(
    mut role: Role<'_>,
    comm: &Communicator,
    partition: &Partition,
    transform: FeatureTransform,
    totals: Option<(f64, usize)>,
    setup: RankSetup,
) -> Result<Option<LeaderResult>, FitError> {
    let rank = comm.rank();
    let (total_weight, num_rows) = global_totals(comm, partition, totals)?;
    if !(total_weight > 0.0) {
        return Err(zero_weight(rank));
    }

    let mut state = CoordinateState::new(partition, &transform);
    let mut beta = Array1::<f64>::zeros(setup.num_features);
    let mut iteration = 0;
    let mut decision = role.decide(comm, |controller, _| controller.control_point(0))?;

    let status = loop {
        match decision {
            Decision::Continue => {}
            Decision::Stop(status) => break status,
            Decision::Cancel => {
                return Err(FitError::Cancelled {
                    completed_iterations: iteration,
                });
            }
        }

        let prev = beta.clone();
        for &j in &transform.active {
            let mut terms = state.coordinate_terms(partition, j);
            comm.all_reduce_sum(&mut terms)?;
            let mut update = [beta[j]];
            if let Role::Leader { controller, .. } = &role {
                update[0] = controller.update_coordinate(beta[j], &terms, total_weight);
            }
            comm.broadcast(&mut update)?;
            state.apply_coordinate(partition, j, update[0] - beta[j]);
            beta[j] = update[0];
        }
        iteration += 1;

        let mut loss = [state.weighted_loss(partition)];
        comm.all_reduce_sum(&mut loss)?;
        decision = role.decide(comm, |controller, observer| {
            let objective = controller.objective(loss[0], total_weight, &beta);
            controller.after_sweep(iteration, &prev, &beta, objective, observer)
        })?;
    };

    Ok(finish(
        role,
        beta,
        transform,
        status,
        iteration,
        Vec::new(),
        (total_weight, num_rows),
    ))
}

/// Total weight and row count over all ranks: from the statistics passes when they ran,
/// otherwise from one `[W, n]` all-reduce.
fn global_totals(
    comm: &Communicator,
    partition: &Partition,
    totals: Option<(f64, usize)>,
) -> Result<(f64, usize), FitError> {
    if let Some(totals) = totals {
        return Ok(totals);
    }
    let mut buffer = [partition.weights().sum(), partition.nrows() as f64];
    comm.all_reduce_sum(&mut buffer)?;
    Ok((buffer[0], buffer[1].round() as usize))
}

fn finish(
    role: Role<'_>,
    working: Array1<f64>,
    transform: FeatureTransform,
    status: FitStatus,
    iterations: usize,
    warnings: Vec<FitWarning>,
    (total_weight, num_rows): (f64, usize),
) -> Option<LeaderResult> {
    let Role::Leader {
        controller,
        observer,
    } = role
    else {
        return None;
    };
    controller.finish(status, observer);
    Some(LeaderResult {
        working,
        transform,
        status,
        iterations,
        warnings,
        total_weight,
        num_rows,
    })
}
