
use jobmesh::{
    JobMeshConfig, JobService, ScheduleOptions, StaticTopology,
    config::QueueType,
    cron::CronSchedule,
    scheduler::task,
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use test_utils::{ScriptedConsumer, start_service, wait_until};
use tokio::time::sleep;

const WAIT: Duration = Duration::from_secs(5);

fn counting_task(counter: Arc<AtomicUsize>) -> jobmesh::scheduler::ScheduledTask {
    task(move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

#[tokio::test]
async fn test_scheduled_jobs_run_through_queues() {
    let service = start_service(QueueType::Unordered);
    service
        .subsystem()
        .register(ScriptedConsumer::succeeding("reports/render"));
    let manager = service.manager();

    let name = manager
        .new_job_builder("reports", "reports/render")
        .property("period", "hourly")
        .schedule(
            ScheduleOptions::now_repeating(Some(3), Duration::from_millis(20)).name("reports"),
        )
        .unwrap();
    assert_eq!(name, "reports");

    assert!(wait_until(WAIT, || manager.statistics().finished == 3).await);
    assert!(wait_until(WAIT, || service.scheduler().scheduled_jobs().is_empty()).await);
    service.shutdown().await;
}

#[tokio::test]
async fn test_cron_schedules_replace_and_unschedule() {
    let service = JobService::start(JobMeshConfig::new()).unwrap();
    let scheduler = service.scheduler();
    let noop = task(|| async { Ok(()) });

    let hourly = ScheduleOptions::cron(CronSchedule::hourly(15).unwrap()).name("hourly");
    scheduler.schedule(noop.clone(), hourly.clone()).unwrap();
    scheduler.schedule(noop.clone(), hourly).unwrap();
    assert_eq!(scheduler.scheduled_jobs().len(), 1);

    scheduler
        .schedule(
            noop.clone(),
            ScheduleOptions::cron(scheduler.cron_schedule("0 0 6 * * *").unwrap()).name("daily"),
        )
        .unwrap();
    scheduler
        .schedule(
            noop,
            ScheduleOptions::cron(CronSchedule::weekly(chrono::Weekday::Sun, 23, 0).unwrap())
                .name("weekly"),
        )
        .unwrap();
    assert_eq!(scheduler.scheduled_jobs().len(), 3);

    for (name, remaining) in [("hourly", 2), ("daily", 1), ("weekly", 0)] {
        assert!(scheduler.unschedule(name));
        assert_eq!(scheduler.scheduled_jobs().len(), remaining);
    }
    service.shutdown().await;
}

#[tokio::test]
async fn test_placement_follows_topology() {
    let topology = Arc::new(StaticTopology::new(
        "node-b",
        vec!["node-a".to_string(), "node-b".to_string()],
        false,
    ));
    let service = JobService::builder(JobMeshConfig::new())
        .with_topology(topology.clone())
        .start()
        .unwrap();
    let scheduler = service.scheduler();

    let leader = Arc::new(AtomicUsize::new(0));
    let single = Arc::new(AtomicUsize::new(0));
    let listed = Arc::new(AtomicUsize::new(0));
    scheduler
        .schedule(
            counting_task(leader.clone()),
            ScheduleOptions::now().on_leader_only(),
        )
        .unwrap();
    scheduler
        .schedule(
            counting_task(single.clone()),
            ScheduleOptions::now().on_single_instance_only(),
        )
        .unwrap();
    scheduler
        .schedule(
            counting_task(listed.clone()),
            ScheduleOptions::now().on_instances_only(vec!["node-b".to_string()]),
        )
        .unwrap();

    assert!(wait_until(WAIT, || listed.load(Ordering::SeqCst) == 1).await);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(leader.load(Ordering::SeqCst), 0);
    assert_eq!(single.load(Ordering::SeqCst), 0);

    topology.set_leader(true);
    scheduler
        .schedule(
            counting_task(leader.clone()),
            ScheduleOptions::now().on_leader_only(),
        )
        .unwrap();
    assert!(wait_until(WAIT, || leader.load(Ordering::SeqCst) == 1).await);
    service.shutdown().await;
}

#[tokio::test]
async fn test_rapid_ticks_never_overlap() {
    let service = JobService::start(JobMeshConfig::new()).unwrap();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));

    let body = {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        let runs = runs.clone();
        task(move || {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            let runs = runs.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(25)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };
    service
        .scheduler()
        .schedule(
            body,
            ScheduleOptions::now_repeating(None, Duration::from_millis(1)).name("rapid"),
        )
        .unwrap();

    assert!(wait_until(WAIT, || runs.load(Ordering::SeqCst) >= 3).await);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(service.scheduler().unschedule("rapid"));
    service.shutdown().await;
}

#[tokio::test]
async fn test_replacing_a_trigger_while_it_runs() {
    let service = JobService::start(JobMeshConfig::new()).unwrap();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));

    let body = {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        let runs = runs.clone();
        task(move || {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            let runs = runs.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(300)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };
    let options = ScheduleOptions::now_repeating(None, Duration::from_millis(20)).name("tick");

    let scheduler = service.scheduler();
    scheduler.schedule(body.clone(), options.clone()).unwrap();
    sleep(Duration::from_millis(50)).await;
    scheduler.schedule(body, options).unwrap();
    assert_eq!(scheduler.scheduled_jobs().len(), 1);

    assert!(wait_until(WAIT, || runs.load(Ordering::SeqCst) >= 2).await);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(scheduler.unschedule("tick"));
    service.shutdown().await;
}
