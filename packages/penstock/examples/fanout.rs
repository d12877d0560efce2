// fan-out / fan-in over two buses: a supervisor broadcasts each job to every
// worker's inbox, workers answer on a results channel of a second bus, and a
// collector drains the answers. closing the inboxes is what lets the workers
// exit.
//
//     cargo run --example fanout

use penstock::{Bus, ChannelId};
use std::num::NonZeroUsize;
use waterwheel::Executor;

const WORKERS: u32 = 3;
const JOBS: u32 = 5;

fn main() {
    let exec = Executor::new();
    let jobs = Bus::new();
    let answers = Bus::new();
    let cap = NonZeroUsize::new(2).unwrap();

    let inboxes: Vec<ChannelId> = (0..WORKERS).map(|_| jobs.open(cap)).collect();
    let results = answers.open(cap);

    for (worker, &inbox) in inboxes.iter().enumerate() {
        let jobs = jobs.clone();
        let answers = answers.clone();
        exec.spawn(async move {
            while let Ok(job) = jobs.recv(inbox).await {
                answers.send(results, job * 10 + worker as u32).await.unwrap();
            }
            println!("worker {worker} done");
        });
    }

    {
        let answers = answers.clone();
        exec.spawn(async move {
            for _ in 0..WORKERS * JOBS {
                let r = answers.recv(results).await.unwrap();
                println!("result {r}");
            }
            answers.close(results).await;
        });
    }

    {
        let jobs = jobs.clone();
        exec.spawn(async move {
            for job in 1..=JOBS {
                jobs.broadcast(job).await.unwrap();
            }
            for inbox in inboxes {
                jobs.close(inbox).await;
            }
        });
    }

    let pending = exec.run();
    assert_eq!(pending, 0, "some fiber is still parked");
}
