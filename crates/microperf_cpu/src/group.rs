//! In-process process group: one thread per rank, collectives over shared buffers.
//!
//! Every collective is publish -> barrier -> read peers -> barrier, so a rank never overwrites its
//! slot while a peer may still be reading it.

use std::sync::{Arc, Barrier, Mutex, OnceLock};

use anyhow::ensure;

pub struct LocalGroup {
    world_size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Vec<f32>>>,
    counts: Mutex<Vec<u64>>,
    /// (available, total) host bytes, read once so every rank provisions against the same number
    memory: OnceLock<(u64, u64)>,
}

impl LocalGroup {
    pub fn new(world_size: usize) -> Arc<Self> {
        let world_size = world_size.max(1);
        Arc::new(Self {
            world_size,
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![Vec::new(); world_size]),
            counts: Mutex::new(vec![0; world_size]),
            memory: OnceLock::new(),
        })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn memory_snapshot(&self, read: impl FnOnce() -> (u64, u64)) -> (u64, u64) {
        *self.memory.get_or_init(read)
    }

    /// Block until every rank reaches this point
    pub fn barrier(&self) {
        self.barrier.wait();
    }

    fn publish(&self, rank: usize, data: &[f32]) -> anyhow::Result<()> {
        ensure!(rank < self.world_size, "rank {rank} out of range");
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| anyhow::anyhow!("a peer rank panicked"))?;
        slots[rank].clear();
        slots[rank].extend_from_slice(data);
        Ok(())
    }

    /// Publish `data`, then run `read` over every rank's published buffer
    fn exchange<R>(
        &self,
        rank: usize,
        data: &[f32],
        read: impl FnOnce(&[Vec<f32>]) -> R,
    ) -> anyhow::Result<R> {
        self.publish(rank, data)?;
        self.barrier();
        let res = {
            let slots = self
                .slots
                .lock()
                .map_err(|_| anyhow::anyhow!("a peer rank panicked"))?;
            read(slots.as_slice())
        };
        self.barrier();
        Ok(res)
    }

    /// Maximum of one scalar across ranks
    pub fn all_reduce_max(&self, rank: usize, value: u64) -> anyhow::Result<u64> {
        ensure!(rank < self.world_size, "rank {rank} out of range");
        let lock = || {
            self.counts
                .lock()
                .map_err(|_| anyhow::anyhow!("a peer rank panicked"))
        };
        lock()?[rank] = value;
        self.barrier();
        let max = lock()?.iter().copied().max().unwrap_or(value);
        self.barrier();
        Ok(max)
    }

    /// Elementwise sum across ranks, in place
    pub fn all_reduce(&self, rank: usize, buf: &mut [f32]) -> anyhow::Result<()> {
        let summed = self.exchange(rank, buf, |slots| {
            let mut acc = vec![0.0f32; slots[0].len()];
            for s in slots {
                for (a, v) in acc.iter_mut().zip(s) {
                    *a += v;
                }
            }
            acc
        })?;
        buf.copy_from_slice(&summed);
        Ok(())
    }

    /// Concatenate every rank's `input` into `output`, in rank order
    pub fn all_gather(&self, rank: usize, input: &[f32], output: &mut [f32]) -> anyhow::Result<()> {
        ensure!(
            output.len() == input.len() * self.world_size,
            "allgather output must hold world_size inputs"
        );
        let chunk = input.len();
        self.exchange(rank, input, |slots| {
            for (r, s) in slots.iter().enumerate() {
                output[r * chunk..(r + 1) * chunk].copy_from_slice(s);
            }
        })
    }

    /// Sum across ranks, keeping this rank's chunk of the result
    pub fn reduce_scatter(
        &self,
        rank: usize,
        input: &[f32],
        output: &mut [f32],
    ) -> anyhow::Result<()> {
        ensure!(
            input.len() == output.len() * self.world_size,
            "reducescatter input must hold world_size outputs"
        );
        let chunk = output.len();
        self.exchange(rank, input, |slots| {
            output.fill(0.0);
            for s in slots {
                for (o, v) in output.iter_mut().zip(&s[rank * chunk..(rank + 1) * chunk]) {
                    *o += v;
                }
            }
        })
    }

    /// Chunk `j` of this rank's input goes to rank `j`
    pub fn all_to_all(&self, rank: usize, input: &[f32], output: &mut [f32]) -> anyhow::Result<()> {
        ensure!(
            input.len() == output.len() && input.len() % self.world_size == 0,
            "alltoall buffers must match and split evenly across ranks"
        );
        let chunk = input.len() / self.world_size;
        self.exchange(rank, input, |slots| {
            for (src, s) in slots.iter().enumerate() {
                output[src * chunk..(src + 1) * chunk]
                    .copy_from_slice(&s[rank * chunk..(rank + 1) * chunk]);
            }
        })
    }

    /// Copy `root`'s buffer to every rank
    pub fn broadcast(&self, rank: usize, root: usize, buf: &mut [f32]) -> anyhow::Result<()> {
        ensure!(root < self.world_size, "broadcast root {root} out of range");
        let data: &[f32] = if rank == root { &buf[..] } else { &[] };
        let received = self.exchange(rank, data, |slots| slots[root].clone())?;
        if rank != root {
            buf.copy_from_slice(&received);
        }
        Ok(())
    }

    /// Ranks are paired (0,1), (2,3), ...; each sends to and receives from its partner. An
    /// unpaired last rank (or a group of one) loops back to itself.
    pub fn send_recv(&self, rank: usize, send: &[f32], recv: &mut [f32]) -> anyhow::Result<()> {
        let peer = if (rank ^ 1) < self.world_size {
            rank ^ 1
        } else {
            rank
        };
        self.exchange(rank, send, |slots| recv.copy_from_slice(&slots[peer]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ranks<R: Send>(world: usize, f: impl Fn(usize, &LocalGroup) -> R + Sync) -> Vec<R> {
        let group = LocalGroup::new(world);
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..world)
                .map(|rank| {
                    let group = &group;
                    let f = &f;
                    s.spawn(move || f(rank, group))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn all_reduce_sums_every_rank() {
        let out = run_ranks(4, |rank, g| {
            let mut buf = vec![rank as f32; 3];
            g.all_reduce(rank, &mut buf).unwrap();
            buf
        });
        for buf in out {
            assert_eq!(buf, vec![6.0; 3]);
        }
    }

    #[test]
    fn all_gather_orders_by_rank() {
        let out = run_ranks(3, |rank, g| {
            let mut output = vec![0.0; 6];
            g.all_gather(rank, &[rank as f32, 10.0 + rank as f32], &mut output)
                .unwrap();
            output
        });
        for o in out {
            assert_eq!(o, vec![0.0, 10.0, 1.0, 11.0, 2.0, 12.0]);
        }
    }

    #[test]
    fn reduce_scatter_keeps_own_chunk() {
        let out = run_ranks(2, |rank, g| {
            let input = [1.0, 2.0, 3.0, 4.0];
            let mut output = vec![0.0; 2];
            g.reduce_scatter(rank, &input, &mut output).unwrap();
            output
        });
        assert_eq!(out[0], vec![2.0, 4.0]);
        assert_eq!(out[1], vec![6.0, 8.0]);
    }

    #[test]
    fn all_to_all_transposes_chunks() {
        let out = run_ranks(2, |rank, g| {
            let base = rank as f32 * 10.0;
            let input = [base, base + 1.0];
            let mut output = vec![0.0; 2];
            g.all_to_all(rank, &input, &mut output).unwrap();
            output
        });
        assert_eq!(out[0], vec![0.0, 10.0]);
        assert_eq!(out[1], vec![1.0, 11.0]);
    }

    #[test]
    fn broadcast_from_root() {
        let out = run_ranks(3, |rank, g| {
            let mut buf = vec![rank as f32; 2];
            g.broadcast(rank, 1, &mut buf).unwrap();
            buf
        });
        for buf in out {
            assert_eq!(buf, vec![1.0, 1.0]);
        }
    }

    #[test]
    fn send_recv_pairs_and_loops_back() {
        let out = run_ranks(3, |rank, g| {
            let mut recv = vec![0.0; 1];
            g.send_recv(rank, &[rank as f32], &mut recv).unwrap();
            recv[0]
        });
        assert_eq!(out, vec![1.0, 0.0, 2.0]);
    }

    #[test]
    fn all_reduce_max_agrees_on_largest() {
        let out = run_ranks(3, |rank, g| {
            let first = g.all_reduce_max(rank, [7, 42, 3][rank]).unwrap();
            let second = g.all_reduce_max(rank, rank as u64).unwrap();
            (first, second)
        });
        assert_eq!(out, vec![(42, 2); 3]);
    }

    #[test]
    fn single_rank_group_is_identity() {
        let g = LocalGroup::new(1);
        let mut buf = vec![3.0, 4.0];
        g.all_reduce(0, &mut buf).unwrap();
        assert_eq!(buf, vec![3.0, 4.0]);
        let mut out = vec![0.0; 2];
        g.all_gather(0, &buf, &mut out).unwrap();
        assert_eq!(out, buf);
    }
}
