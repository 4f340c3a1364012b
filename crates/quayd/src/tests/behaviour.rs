//! Behavioural tests for the daemon bootstrap sequence.

use std::cell::RefCell;
use std::sync::Arc;

use quay_config::{Config, LimitAdjustment};
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

use crate::bootstrap::{BootstrapError, ConfigLoader, Daemon, bootstrap_with};

use super::support::{FailingConfigLoader, HealthEvent, RecordingHealthReporter, TestConfigLoader};

type StepResult = Result<(), String>;

struct BootstrapWorld {
    loader: Box<dyn ConfigLoader>,
    reporter: Arc<RecordingHealthReporter>,
    outcome: Option<Result<Daemon, BootstrapError>>,
}

impl BootstrapWorld {
    fn new() -> Self {
        Self {
            loader: Box::new(TestConfigLoader::new()),
            reporter: Arc::new(RecordingHealthReporter::default()),
            outcome: None,
        }
    }

    fn use_loader(&mut self, loader: impl ConfigLoader + 'static) {
        self.loader = Box::new(loader);
        self.outcome = None;
    }

    fn bootstrap(&mut self) {
        let reporter = Arc::clone(&self.reporter) as Arc<dyn crate::health::HealthReporter>;
        self.outcome = Some(bootstrap_with(&*self.loader, reporter));
    }

    fn daemon(&self) -> Result<&Daemon, String> {
        match &self.outcome {
            Some(Ok(daemon)) => Ok(daemon),
            Some(Err(error)) => Err(format!("bootstrap failed: {error}")),
            None => Err("bootstrap has not run".to_owned()),
        }
    }

    fn events(&self) -> Vec<HealthEvent> {
        self.reporter.events()
    }
}

fn zero_residents(config: &mut Config) {
    config.resident_workers = 0;
    config.max_workers = None;
}

fn ceiling_below_residents(config: &mut Config) {
    config.resident_workers = 3;
    config.max_workers = Some(2);
}

#[fixture]
fn world() -> RefCell<BootstrapWorld> {
    RefCell::new(BootstrapWorld::new())
}

#[given("a healthy configuration loader")]
fn given_healthy_loader(world: &RefCell<BootstrapWorld>) {
    world.borrow_mut().use_loader(TestConfigLoader::new());
}

#[given("a failing configuration loader")]
fn given_failing_loader(world: &RefCell<BootstrapWorld>) {
    world.borrow_mut().use_loader(FailingConfigLoader);
}

#[given("a configuration with zero resident workers")]
fn given_zero_residents(world: &RefCell<BootstrapWorld>) {
    world
        .borrow_mut()
        .use_loader(TestConfigLoader::with_overrides(zero_residents));
}

#[given("a configuration whose ceiling is below the resident count")]
fn given_low_ceiling(world: &RefCell<BootstrapWorld>) {
    world
        .borrow_mut()
        .use_loader(TestConfigLoader::with_overrides(ceiling_below_residents));
}

#[when("the daemon bootstrap runs")]
fn when_bootstrap_runs(world: &RefCell<BootstrapWorld>) {
    world.borrow_mut().bootstrap();
}

#[then("bootstrap succeeds")]
fn then_bootstrap_succeeds(world: &RefCell<BootstrapWorld>) -> StepResult {
    world.borrow().daemon().map(|_| ())
}

#[then("bootstrap fails")]
fn then_bootstrap_fails(world: &RefCell<BootstrapWorld>) {
    let world = world.borrow();
    assert!(
        matches!(
            world.outcome,
            Some(Err(BootstrapError::Configuration { .. }))
        ),
        "expected a configuration failure"
    );
}

#[then("the reporter saw bootstrap start and succeed")]
fn then_start_and_success_reported(world: &RefCell<BootstrapWorld>) {
    let events = world.borrow().events();
    assert_eq!(events.first(), Some(&HealthEvent::BootstrapStarting));
    assert_eq!(events.last(), Some(&HealthEvent::BootstrapSucceeded));
}

#[then("the reporter saw the bootstrap failure")]
fn then_failure_reported(world: &RefCell<BootstrapWorld>) {
    let events = world.borrow().events();
    assert!(
        events
            .iter()
            .any(|event| matches!(event, HealthEvent::BootstrapFailed(_))),
        "expected a failure event, got {events:?}"
    );
    assert!(!events.contains(&HealthEvent::BootstrapSucceeded));
}

#[then("the resident count is raised to {count}")]
fn then_resident_raised(world: &RefCell<BootstrapWorld>, count: usize) -> StepResult {
    let world = world.borrow();
    let limits = world.daemon()?.config().pool_limits();
    assert_eq!(limits.resident(), count);
    assert!(
        world
            .events()
            .contains(&HealthEvent::LimitsAdjusted(LimitAdjustment::ResidentRaised)),
        "expected a resident adjustment event"
    );
    Ok(())
}

#[then("the ceiling is raised to {count}")]
fn then_ceiling_raised(world: &RefCell<BootstrapWorld>, count: usize) -> StepResult {
    let world = world.borrow();
    let limits = world.daemon()?.config().pool_limits();
    assert_eq!(limits.max(), count);
    assert!(
        world
            .events()
            .contains(&HealthEvent::LimitsAdjusted(LimitAdjustment::MaxRaised {
                configured: 2
            })),
        "expected a ceiling adjustment event"
    );
    Ok(())
}

#[scenario(
    path = "tests/features/daemon_bootstrap.feature",
    name = "Bootstrap succeeds with a healthy configuration"
)]
fn bootstrap_succeeds(#[from(world)] _: RefCell<BootstrapWorld>) {}

#[scenario(
    path = "tests/features/daemon_bootstrap.feature",
    name = "Bootstrap reports configuration failures"
)]
fn bootstrap_reports_failures(#[from(world)] _: RefCell<BootstrapWorld>) {}

#[scenario(
    path = "tests/features/daemon_bootstrap.feature",
    name = "Zero resident workers are raised to one"
)]
fn zero_residents_raised(#[from(world)] _: RefCell<BootstrapWorld>) {}

#[scenario(
    path = "tests/features/daemon_bootstrap.feature",
    name = "A ceiling below the resident count is raised"
)]
fn low_ceiling_raised(#[from(world)] _: RefCell<BootstrapWorld>) {}
