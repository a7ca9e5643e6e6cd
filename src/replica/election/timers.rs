use crate::actor::WeakActorClient;
use crate::replica::election::clock::{Clock, SystemClock};
use crate::replica::{LeaderTimerTick, ReplicaId, Term};
use rand::Rng;
use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, Weak};
use tokio::time::{Duration, Instant};

/// Alarm is shared between a timer and its background task. The owner pushes the deadline out,
/// the task sleeps towards it. Once the owner drops the timer the task can no longer upgrade its
/// weak reference and exits, so a timer never outlives the election role that created it.
struct Alarm<C> {
    deadline: Mutex<Option<Instant>>,
    clock: C,
}

impl<C: Clock> Alarm<C> {
    fn new(clock: C) -> Arc<Self> {
        Arc::new(Alarm {
            deadline: Mutex::new(None),
            clock,
        })
    }

    fn push_back(&self, delay: Duration) {
        let deadline = self.clock.now() + delay;
        *self.deadline.lock().expect("Alarm deadline mutex poisoned") = Some(deadline);
    }

    fn take(&self) -> Option<Instant> {
        self.deadline.lock().expect("Alarm deadline mutex poisoned").take()
    }
}

/// What the task saw when it woke up.
enum Wake {
    Rearmed(Instant),
    Expired,
    Stopped,
}

fn check<C: Clock>(alarm: &Weak<Alarm<C>>) -> Wake {
    match alarm.upgrade() {
        None => Wake::Stopped,
        Some(alarm) => match alarm.take() {
            Some(deadline) => Wake::Rearmed(deadline),
            None => Wake::Expired,
        },
    }
}

// ------- Election timer --------

/// ElectionTimer fires `FollowerTimeout` at the actor when no leader has been heard from within a
/// randomized timeout. Followers reset it on every valid AppendEntries; candidates just hold it so
/// a split vote eventually retries.
pub(crate) struct ElectionTimer<C: Clock = SystemClock> {
    alarm: Arc<Alarm<C>>,
    timeout_range: RangeInclusive<Duration>,
}

impl ElectionTimer {
    pub(crate) fn start(min_timeout: Duration, max_timeout: Duration, actor_client: WeakActorClient) -> Self {
        let (timer, task) = election_timer(min_timeout, max_timeout, actor_client, SystemClock);
        tokio::spawn(task);
        timer
    }
}

impl<C: Clock> ElectionTimer<C> {
    pub(crate) fn reset(&self) {
        let timeout = rand::thread_rng().gen_range(self.timeout_range.clone());
        self.alarm.push_back(timeout);
    }
}

fn election_timer<C: Clock>(
    min_timeout: Duration,
    max_timeout: Duration,
    actor_client: WeakActorClient,
    clock: C,
) -> (ElectionTimer<C>, impl Future<Output = ()>) {
    let alarm = Alarm::new(clock.clone());
    let timer = ElectionTimer {
        alarm,
        timeout_range: min_timeout..=max_timeout,
    };
    // Armed before the task starts, otherwise a fresh follower would time out immediately.
    timer.reset();

    let task = run_election_timer(Arc::downgrade(&timer.alarm), clock, min_timeout, actor_client);
    (timer, task)
}

async fn run_election_timer<C: Clock>(
    alarm: Weak<Alarm<C>>,
    mut clock: C,
    retry_after: Duration,
    actor_client: WeakActorClient,
) {
    loop {
        match check(&alarm) {
            Wake::Stopped => return,
            Wake::Rearmed(deadline) => clock.sleep_until(deadline).await,
            Wake::Expired => {
                // The actor may be handling an AppendEntries that resets us right now. If it
                // does, the next check sees a new deadline; if not, we fire again after a pause.
                let _ = actor_client.follower_timeout().await;
                clock.sleep(retry_after).await;
            }
        }
    }
}

// ------- Heartbeat timer --------

/// HeartbeatTimer makes a leader contact one peer at least every `period`. Each tick asks the
/// actor to send that peer AppendEntries (or resume a snapshot). Sending anything to the peer
/// early should call `reset()` so idle heartbeats don't pile on top of real traffic.
pub(crate) struct HeartbeatTimer<C: Clock = SystemClock> {
    alarm: Arc<Alarm<C>>,
    period: Duration,
}

impl HeartbeatTimer {
    pub(crate) fn start(period: Duration, actor_client: WeakActorClient, peer_id: ReplicaId, term: Term) -> Self {
        let (timer, task) = heartbeat_timer(period, actor_client, LeaderTimerTick { peer_id, term }, SystemClock);
        tokio::spawn(task);
        timer
    }
}

impl<C: Clock> HeartbeatTimer<C> {
    pub(crate) fn reset(&self) {
        self.alarm.push_back(self.period);
    }
}

fn heartbeat_timer<C: Clock>(
    period: Duration,
    actor_client: WeakActorClient,
    tick: LeaderTimerTick,
    clock: C,
) -> (HeartbeatTimer<C>, impl Future<Output = ()>) {
    // No deadline yet: the first tick goes out as soon as the task runs, so a new leader (or a
    // newly added peer) is contacted right away.
    let alarm = Alarm::new(clock.clone());
    let task = run_heartbeat_timer(Arc::downgrade(&alarm), clock, period, actor_client, tick);
    (HeartbeatTimer { alarm, period }, task)
}

async fn run_heartbeat_timer<C: Clock>(
    alarm: Weak<Alarm<C>>,
    mut clock: C,
    period: Duration,
    actor_client: WeakActorClient,
    tick: LeaderTimerTick,
) {
    loop {
        match check(&alarm) {
            Wake::Stopped => return,
            Wake::Rearmed(deadline) => clock.sleep_until(deadline).await,
            Wake::Expired => {
                let _ = actor_client.leader_timer(tick.clone()).await;
                match alarm.upgrade() {
                    Some(alarm) => alarm.push_back(period),
                    None => return,
                }
            }
        }
    }
}
