#![no_main]

use std::sync::mpsc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Duration;

use libfuzzer_sys::fuzz_target;
use strand_proto::{decode_message, HEADER_SIZE};

mod utils;

const TIMEOUT: Duration = Duration::from_secs(1);

struct Runner {
    input_tx: mpsc::SyncSender<Vec<u8>>,
    output_rx: Mutex<mpsc::Receiver<()>>,
}

fn runner() -> &'static Runner {
    static RUNNER: OnceLock<Runner> = OnceLock::new();
    RUNNER.get_or_init(|| {
        let (input_tx, input_rx) = mpsc::sync_channel::<Vec<u8>>(0);
        let (output_tx, output_rx) = mpsc::sync_channel::<()>(0);

        std::thread::spawn(move || {
            for input in input_rx {
                if let Ok((header, body)) = decode_message(&input, utils::MESSAGE_SIZE_MAX) {
                    assert!(header.size >= HEADER_SIZE);
                    assert!(header.size <= utils::MESSAGE_SIZE_MAX);
                    assert!(body.len() <= utils::MESSAGE_SIZE_MAX);
                }
                let _ = output_tx.send(());
            }
        });

        Runner {
            input_tx,
            output_rx: Mutex::new(output_rx),
        }
    })
}

fuzz_target!(|data: &[u8]| {
    let runner = runner();
    runner
        .input_tx
        .send(utils::capped(data).to_vec())
        .expect("fuzz_decode_message worker thread exited");

    match runner
        .output_rx
        .lock()
        .expect("fuzz_decode_message worker receiver poisoned")
        .recv_timeout(TIMEOUT)
    {
        Ok(()) => {}
        Err(mpsc::RecvTimeoutError::Timeout) => panic!("fuzz_decode_message fuzz target timed out"),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            panic!("fuzz_decode_message worker thread panicked")
        }
    }
});
