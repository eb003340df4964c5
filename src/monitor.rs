//! Periodic frequency refresh

use crate::{
    cpu::{
        freq::{SampleSummary, Sampler},
        topology::{self, Topology},
    },
    error::{Error, Result},
    format::ReportFormatter,
    report::{self, Publisher, ReportEndpoint},
    store::FrequencyStore,
};

use async_std::{channel, future, task};

use chrono::{DateTime, Local};

use slog::{debug, error, info, o, Logger};

use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

/// Default delay between the end of a refresh and the start of the next one
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// What happened during a refresh cycle
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RefreshStats {
    /// Number of physical cores with an online thread
    pub representatives: usize,

    /// Outcome of frequency sampling
    pub samples: SampleSummary,

    /// Size of the published report in bytes
    pub report_len: usize,

    /// Time at which the report was published
    pub published_at: DateTime<Local>,
}

/// One full topology → sampling → formatting → publication pipeline
pub struct Refresher {
    /// Source of topology information
    topology: Box<dyn Topology + Send>,

    /// Frequency sampling mechanism
    sampler: Sampler,

    /// Frequency records, one per logical CPU slot
    store: FrequencyStore,

    /// Report rendering
    formatter: ReportFormatter,

    /// Report publication
    publisher: Publisher,
}

impl Refresher {
    /// Allocate a frequency store with `capacity` slots, and set up the
    /// machinery to fill it and publish its contents.
    pub fn new(
        topology: impl Topology + Send + 'static,
        sampler: Sampler,
        capacity: usize,
    ) -> Result<Self> {
        let store = FrequencyStore::new(capacity)?;
        let (publisher, _endpoint) = report::publication();
        Ok(Self {
            topology: Box::new(topology),
            sampler,
            store,
            formatter: ReportFormatter::new(capacity),
            publisher,
        })
    }

    /// Use a custom report formatter
    pub fn with_formatter(mut self, formatter: ReportFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    /// Check that every logical CPU that the host may report has a slot
    pub fn check_capacity(&self) -> Result<()> {
        let required = self.topology.possible_cpu_count()?;
        let capacity = self.store.capacity();
        if required > capacity {
            return Err(Error::CapacityExceeded { capacity, required });
        }
        Ok(())
    }

    /// Frequency records
    pub fn store(&self) -> &FrequencyStore {
        &self.store
    }

    /// Read-only view of the published report
    pub fn endpoint(&self) -> ReportEndpoint {
        self.publisher.endpoint()
    }

    /// Run one refresh cycle
    ///
    /// If this fails, the previously published report stays in place.
    ///
    pub fn refresh(&mut self, log: &Logger) -> Result<RefreshStats> {
        let representatives = topology::representatives(&*self.topology)?;
        debug!(log, "Resolved representative CPUs";
               "core count" => representatives.len());
        let samples = self.sampler.sample(log, &representatives, &mut self.store);
        let text = self.formatter.format(&representatives, &self.store)?;
        let report = self.publisher.publish(text);
        Ok(RefreshStats {
            representatives: representatives.len(),
            samples,
            report_len: report.as_bytes().len(),
            published_at: report.published_at(),
        })
    }
}

/// Run a refresh cycle on async-std's blocking thread pool
///
/// Sysfs and MSR device reads block, so they must not run on an executor
/// worker. The refresher is handed back along with the outcome.
///
async fn refresh_blocking(
    mut refresher: Refresher,
    log: Logger,
) -> (Refresher, Result<RefreshStats>) {
    task::spawn_blocking(move || {
        let result = refresher.refresh(&log);
        (refresher, result)
    })
    .await
}

/// Activity of the refresh driver
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DriverState {
    /// Waiting for the next refresh
    Idle,

    /// Running a refresh cycle
    Refreshing,

    /// Not refreshing anymore
    Stopped,
}

impl DriverState {
    fn from_u8(state: u8) -> Self {
        match state {
            0 => DriverState::Idle,
            1 => DriverState::Refreshing,
            _ => DriverState::Stopped,
        }
    }
}

/// Driver state that can be observed from outside of the refresh task
#[derive(Clone)]
struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(DriverState::Idle as u8)))
    }

    fn get(&self) -> DriverState {
        DriverState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: DriverState) -> DriverState {
        DriverState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
    }
}

/// Frequency monitoring service
///
/// Refreshes the published frequency report at a fixed interval from a
/// single background task, so refresh cycles never overlap. The next cycle
/// starts `interval` after the previous one has completed.
///
pub struct Service {
    /// Read-only view of the published report
    endpoint: ReportEndpoint,

    /// Refresh task activity
    state: SharedState,

    /// Dropping this tells the refresh task to stop
    stop: channel::Sender<()>,

    /// Refresh task, which hands back the refresher once stopped
    task: task::JoinHandle<Refresher>,
}

impl Service {
    /// Start monitoring
    ///
    /// Checks the store capacity and runs a first refresh before returning,
    /// so that the report endpoint never serves an empty report once the
    /// service is started.
    ///
    pub async fn start(refresher: Refresher, interval: Duration, log: Logger) -> Result<Self> {
        let refresher =
            task::spawn_blocking(move || refresher.check_capacity().map(|()| refresher)).await?;
        let (refresher, stats) = refresh_blocking(refresher, log.clone()).await;
        let stats = stats?;
        info!(log, "Started frequency monitoring";
              "core count" => stats.representatives,
              "store capacity" => refresher.store().capacity(),
              "refresh interval (ms)" => interval.as_millis() as u64);

        let endpoint = refresher.endpoint();
        let state = SharedState::new();
        let (stop, stop_signal) = channel::bounded(1);
        let task = task::spawn(run(refresher, interval, stop_signal, state.clone(), log));
        Ok(Self {
            endpoint,
            state,
            stop,
            task,
        })
    }

    /// Read-only view of the published report
    pub fn endpoint(&self) -> ReportEndpoint {
        self.endpoint.clone()
    }

    /// Current activity of the refresh task
    pub fn state(&self) -> DriverState {
        self.state.get()
    }

    /// Stop monitoring
    ///
    /// Waits for an ongoing refresh cycle, if any, to complete. The refresher
    /// is handed back once the refresh task is gone.
    ///
    pub async fn stop(self) -> Refresher {
        self.stop.close();
        self.task.await
    }
}

/// Refresh task
async fn run(
    mut refresher: Refresher,
    interval: Duration,
    stop_signal: channel::Receiver<()>,
    state: SharedState,
    log: Logger,
) -> Refresher {
    let mut cycle = 0u64;
    // Either a stop message or the closing of the channel stops the task
    while future::timeout(interval, stop_signal.recv()).await.is_err() {
        cycle += 1;
        let cycle_log = log.new(o!("cycle" => cycle));
        let previous = state.set(DriverState::Refreshing);
        debug_assert_eq!(previous, DriverState::Idle, "Refresh cycles overlapped");
        let (returned, result) = refresh_blocking(refresher, cycle_log.clone()).await;
        refresher = returned;
        match result {
            Ok(stats) => debug!(cycle_log, "Refreshed frequency report";
                                "core count" => stats.representatives,
                                "sampled" => stats.samples.sampled,
                                "failed" => stats.samples.failed,
                                "report size" => stats.report_len,
                                "published at" => %stats.published_at),
            Err(err) => error!(cycle_log, "Refresh failed, keeping previous report";
                               "error" => %err),
        }
        state.set(DriverState::Idle);
    }
    state.set(DriverState::Stopped);
    info!(log, "Stopped frequency monitoring"; "cycle count" => cycle);
    refresher
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        cpu::{freq::RatioDecoder, topology::CoreId},
        CpuId,
    };

    use std::{
        io,
        sync::atomic::{AtomicBool, AtomicU64, AtomicUsize},
    };

    fn discard() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    /// Two cores with two threads each, CPUs 0-3
    struct FakeTopology {
        possible: usize,
    }

    impl Topology for FakeTopology {
        fn online_cpus(&self) -> Result<Vec<CpuId>> {
            Ok(vec![0, 1, 2, 3])
        }

        fn core_id_of(&self, cpu: CpuId) -> Result<CoreId> {
            Ok(CoreId::new((cpu / 2) as u32))
        }

        fn possible_cpu_count(&self) -> Result<usize> {
            Ok(self.possible)
        }
    }

    /// Register reader that replays a fixed ratio sequence for every CPU
    fn replay(ratios: &'static [u64], reads: Arc<AtomicUsize>) -> Sampler {
        let reader = move |cpu: CpuId| -> io::Result<u64> {
            let read = reads.fetch_add(1, Ordering::SeqCst);
            let ratio = ratios[(read / 2) % ratios.len()];
            Ok((ratio + cpu as u64) << 8)
        };
        Sampler::new(reader, RatioDecoder::default())
    }

    #[test]
    fn refresh_pipeline() {
        let reads = Arc::new(AtomicUsize::new(0));
        let mut refresher = Refresher::new(
            FakeTopology { possible: 4 },
            replay(&[12, 34, 20], reads.clone()),
            4,
        )
        .unwrap();
        let endpoint = refresher.endpoint();
        for _ in 0..3 {
            let stats = refresher.refresh(&discard()).unwrap();
            assert_eq!(stats.representatives, 2);
            assert_eq!(stats.samples, SampleSummary { sampled: 2, failed: 0 });
            assert_eq!(stats.published_at, endpoint.snapshot().published_at());
        }
        assert_eq!(reads.load(Ordering::SeqCst), 6);
        assert_eq!(
            endpoint.snapshot().text(),
            "CPU 0 Frequency: 2000 MHz, Max: 3400 MHz, Min: 1200 MHz\n\
             CPU 2 Frequency: 2200 MHz, Max: 3600 MHz, Min: 1400 MHz\n"
        );
        for (_, record) in refresher.store().iter() {
            assert!(record.is_consistent());
        }
        // Sibling threads are never sampled
        assert_eq!(refresher.store().get(1).unwrap().current, 0);
    }

    #[test]
    fn overflow_keeps_previous_report() {
        let reads = Arc::new(AtomicUsize::new(0));
        let mut refresher =
            Refresher::new(FakeTopology { possible: 4 }, replay(&[1, 99], reads), 4).unwrap();
        let endpoint = refresher.endpoint();
        refresher.refresh(&discard()).unwrap();
        let first = endpoint.snapshot();

        // 9900 MHz takes one more digit than 100 MHz
        let mut refresher = refresher.with_formatter(ReportFormatter::with_limit(first.as_bytes().len()));
        assert!(matches!(
            refresher.refresh(&discard()),
            Err(Error::ReportOverflow { .. })
        ));
        assert_eq!(endpoint.snapshot().text(), first.text());
    }

    #[async_std::test]
    async fn capacity_check() {
        let sampler = || replay(&[10], Arc::new(AtomicUsize::new(0)));
        let refresher = Refresher::new(FakeTopology { possible: 8 }, sampler(), 4).unwrap();
        assert!(matches!(
            refresher.check_capacity(),
            Err(Error::CapacityExceeded {
                capacity: 4,
                required: 8
            })
        ));
        let refresher = Refresher::new(FakeTopology { possible: 4 }, sampler(), 4).unwrap();
        assert!(refresher.check_capacity().is_ok());
        assert!(matches!(
            Service::start(
                Refresher::new(FakeTopology { possible: 5 }, sampler(), 4).unwrap(),
                DEFAULT_INTERVAL,
                discard()
            )
            .await,
            Err(Error::CapacityExceeded { .. })
        ));
    }

    #[async_std::test]
    async fn service_lifecycle() {
        let reads = Arc::new(AtomicUsize::new(0));
        let refresher = Refresher::new(
            FakeTopology { possible: 4 },
            replay(&[10, 20, 30], reads.clone()),
            4,
        )
        .unwrap();
        let endpoint = refresher.endpoint();
        assert!(endpoint.snapshot().text().is_empty());

        let service = Service::start(refresher, Duration::from_millis(5), discard())
            .await
            .unwrap();
        // The first refresh happens before start() returns
        assert_eq!(reads.load(Ordering::SeqCst), 2);
        assert_eq!(endpoint.snapshot().text().lines().count(), 2);
        assert_ne!(service.state(), DriverState::Stopped);

        while reads.load(Ordering::SeqCst) < 8 {
            task::sleep(Duration::from_millis(5)).await;
        }
        let refresher = service.stop().await;
        let record = refresher.store().get(0).unwrap();
        assert_eq!((record.minimum, record.maximum), (1000, 3000));
        let reads_at_stop = reads.load(Ordering::SeqCst);
        task::sleep(Duration::from_millis(20)).await;
        assert_eq!(reads.load(Ordering::SeqCst), reads_at_stop);
    }

    #[async_std::test]
    async fn stop_reports_stopped_state() {
        let refresher = Refresher::new(
            FakeTopology { possible: 4 },
            replay(&[10], Arc::new(AtomicUsize::new(0))),
            4,
        )
        .unwrap();
        let service = Service::start(refresher, Duration::from_secs(3600), discard())
            .await
            .unwrap();
        assert_eq!(service.state(), DriverState::Idle);
        let state = service.state.clone();
        service.stop().await;
        assert_eq!(state.get(), DriverState::Stopped);
    }

    #[async_std::test]
    async fn refresh_cycles_never_overlap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let cycles = Arc::new(AtomicU64::new(0));
        let reader = {
            let in_flight = in_flight.clone();
            let cycles = cycles.clone();
            move |_cpu: CpuId| -> io::Result<u64> {
                assert_eq!(in_flight.fetch_add(1, Ordering::SeqCst), 0);
                std::thread::sleep(Duration::from_millis(2));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                cycles.fetch_add(1, Ordering::SeqCst);
                Ok(0x10 << 8)
            }
        };
        let refresher = Refresher::new(
            FakeTopology { possible: 4 },
            Sampler::new(reader, RatioDecoder::default()),
            4,
        )
        .unwrap();
        let service = Service::start(refresher, Duration::from_millis(1), discard())
            .await
            .unwrap();
        while cycles.load(Ordering::SeqCst) < 20 {
            task::sleep(Duration::from_millis(5)).await;
        }
        service.stop().await;
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[async_std::test]
    async fn blocked_refreshes_do_not_stall_other_tasks() {
        // More stuck refreshes than a typical host has executor workers
        const SERVICES: usize = 64;
        let stuck = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicBool::new(false));
        let mut services = Vec::with_capacity(SERVICES);
        for _ in 0..SERVICES {
            let reads = AtomicUsize::new(0);
            let stuck = stuck.clone();
            let released = released.clone();
            // The initial refresh goes through, later ones hang until released
            let reader = move |_cpu: CpuId| -> io::Result<u64> {
                let read = reads.fetch_add(1, Ordering::SeqCst);
                if read >= 2 {
                    if read == 2 {
                        stuck.fetch_add(1, Ordering::SeqCst);
                    }
                    while !released.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                Ok(0x10 << 8)
            };
            let refresher = Refresher::new(
                FakeTopology { possible: 4 },
                Sampler::new(reader, RatioDecoder::default()),
                4,
            )
            .unwrap();
            let service = Service::start(refresher, Duration::from_millis(1), discard())
                .await
                .unwrap();
            services.push(service);
        }

        let all_stuck = future::timeout(Duration::from_secs(10), async {
            while stuck.load(Ordering::SeqCst) < SERVICES {
                task::sleep(Duration::from_millis(1)).await;
            }
        });
        assert!(all_stuck.await.is_ok());
        let other_task = future::timeout(Duration::from_secs(10), task::spawn(async { 42 }));
        assert_eq!(other_task.await.ok(), Some(42));
        for service in &services {
            assert_eq!(service.state(), DriverState::Refreshing);
        }

        released.store(true, Ordering::SeqCst);
        for service in services {
            service.stop().await;
        }
    }
}
