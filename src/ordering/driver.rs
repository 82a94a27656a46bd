use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tracing::{debug, info};

use super::message::Event;

/// Four originations per minute.
pub const DEFAULT_RATE: f64 = 4.0 / 60.0;

pub const VOCABULARY: &[&str] = &[
    "Air Ball",
    "Alley-oop",
    "Assist",
    "Backboard",
    "Backcourt",
    "Bank Shot",
    "Baseline",
    "Bench",
    "Block",
    "Bounce Pass",
    "Box Out",
    "Charging",
    "Chest Pass",
    "Double Dribble",
    "Dribble",
    "Dunk",
    "Fast Break",
    "Field Goal",
    "Flagrant Foul",
    "Free Throw",
    "Full-Court Press",
    "Goaltending",
    "Half-Court",
    "Inbounds Pass",
    "Jump Ball",
    "Layup",
    "Man-to-Man Defense",
    "Offense",
    "Overtime",
    "Personal Foul",
    "Pivot",
    "Rebound",
    "Screen",
    "Shot Clock",
    "Slam Dunk",
    "Steal",
    "Technical Foul",
    "Three-Point Line",
    "Traveling",
    "Turnover",
    "Zone Defense",
];

/*
    Originations form a Poisson process with rate `rate` per second: the gap
    before each one is a fresh exponential draw, and the next gap is only
    drawn once the previous origination has fired. A late wakeup therefore
    shifts everything after it instead of producing a burst.
*/

pub struct BroadcastDriver {
    pub rate: f64,
    pub rng: StdRng,
    pub events: UnboundedSender<Event>,
    pub halt: watch::Receiver<bool>,
}

impl BroadcastDriver {
    pub fn new(rate: f64, events: UnboundedSender<Event>, halt: watch::Receiver<bool>) -> Self {
        BroadcastDriver {
            rate,
            rng: StdRng::from_entropy(),
            events,
            halt,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Exponentially distributed gap, `-ln(1 - u) / rate` with `u` in [0, 1).
    pub fn next_delay(&mut self) -> Duration {
        let u: f64 = self.rng.gen();
        Duration::from_secs_f64(-(1.0 - u).ln() / self.rate)
    }

    pub fn next_payload(&mut self) -> &'static str {
        VOCABULARY[self.rng.gen_range(0..VOCABULARY.len())]
    }

    pub async fn run(mut self) {
        info!(rate = self.rate, "broadcast driver started");
        loop {
            if *self.halt.borrow() {
                break;
            }
            let delay = self.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let text = self.next_payload().to_string();
                    debug!(text = %text, "origination due");
                    if self.events.send(Event::Originate(text)).is_err() {
                        break;
                    }
                }
                changed = self.halt.changed() => {
                    if changed.is_err() || *self.halt.borrow() {
                        break;
                    }
                }
            }
        }
        info!("broadcast driver stopped");
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn driver(rate: f64) -> (BroadcastDriver, mpsc::UnboundedReceiver<Event>, watch::Sender<bool>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (halt_tx, halt) = watch::channel(false);
        (BroadcastDriver::new(rate, events, halt).with_seed(7), events_rx, halt_tx)
    }

    #[test]
    fn test_delays_average_to_inverse_rate() {
        let (mut driver, _events, _halt) = driver(2.0);
        let samples = 20_000;

        let total: f64 = (0..samples).map(|_| driver.next_delay().as_secs_f64()).sum();
        let mean = total / samples as f64;

        assert!((mean - 0.5).abs() < 0.02, "mean gap was {mean}");
    }

    #[test]
    fn test_payloads_come_from_vocabulary() {
        let (mut driver, _events, _halt) = driver(1.0);
        for _ in 0..100 {
            assert!(VOCABULARY.contains(&driver.next_payload()));
        }
    }

    #[tokio::test]
    async fn test_originates_until_halted() {
        let (driver, mut events, halt) = driver(200.0);
        let task = tokio::spawn(driver.run());

        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(event, Event::Originate(_)));
        }

        halt.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
