//! Test-only helpers for building column bytes and driving jobs by hand.

use std::{collections::VecDeque, sync::Mutex};

use crate::{
    column::{read_offset, read_var_len, ColumnType, VAR_NULL_LEN},
    executor::Executor,
};

type Job = Box<dyn FnOnce() + Send>;

/// Little-endian `i64` column bytes.
pub(crate) fn ts_bytes(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Offset and data files of a variable-length column.
pub(crate) fn var_column(column_type: ColumnType, values: &[Option<&[u8]>]) -> (Vec<u8>, Vec<u8>) {
    let mut offsets = Vec::new();
    let mut data = Vec::new();
    for value in values {
        offsets.extend_from_slice(&(data.len() as u64).to_le_bytes());
        match value {
            Some(bytes) => {
                column_type.encode_var_header(bytes.len() as i64, &mut data);
                data.extend_from_slice(bytes);
            }
            None => column_type.encode_var_header(VAR_NULL_LEN, &mut data),
        }
    }
    (offsets, data)
}

/// Decode `rows` elements of a variable-length column.
pub(crate) fn read_var_column(
    offsets: &[u8],
    data: &[u8],
    rows: usize,
    header_width: usize,
) -> Vec<Option<Vec<u8>>> {
    (0..rows)
        .map(|row| {
            let at = read_offset(offsets, row) as usize;
            let len = read_var_len(data, at, header_width);
            (len >= 0).then(|| data[at + header_width..at + header_width + len as usize].to_vec())
        })
        .collect()
}

/// Executor that queues jobs until the test runs them, in any order it likes.
#[derive(Default)]
pub(crate) struct DeferredExecutor {
    jobs: Mutex<VecDeque<Job>>,
}

impl DeferredExecutor {
    pub(crate) fn pending(&self) -> usize {
        self.jobs.lock().expect("jobs").len()
    }

    /// Run one queued job picked by `rng`. Returns `false` when nothing is queued.
    pub(crate) fn run_one(&self, rng: &mut fastrand::Rng) -> bool {
        let job = {
            let mut jobs = self.jobs.lock().expect("jobs");
            if jobs.is_empty() {
                return false;
            }
            let at = rng.usize(..jobs.len());
            jobs.remove(at)
        };
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run queued jobs, including ones they spawn, in random order.
    pub(crate) fn run_all(&self, rng: &mut fastrand::Rng) {
        while self.run_one(rng) {}
    }
}

impl Executor for DeferredExecutor {
    fn spawn_blocking<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.jobs.lock().expect("jobs").push_back(Box::new(job));
    }
}
