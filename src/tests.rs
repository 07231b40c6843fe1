//! Cross-module tests: the seed copy scenarios, the planner's count and
//! resume arithmetic, and the pass-through paths driven by an in-memory
//! port.

use crate::cli::Cli;
use crate::engine::CopyEngine;
use crate::error::{CopyError, Result};
use crate::fileio::{self, ByteStream, FaultyFile, FileKind, Side};
use crate::options::Opts;
use clap::Parser;
use std::fs;
use std::path::Path;

fn opts(args: &[&str]) -> Opts {
    try_opts(args).unwrap()
}

fn try_opts(args: &[&str]) -> Result<Opts> {
    let mut full = vec!["ptcopy"];
    full.extend_from_slice(args);
    Opts::from_cli(&Cli::parse_from(full))
}

/// Open both sides from the options and run the copy, returning the result
/// together with the engine so tests can inspect the accumulator.
fn run_copy(mut op: Opts) -> (Result<()>, CopyEngine) {
    if op.outf.is_empty() {
        op.outf = ".".to_string();
    }
    let input = fileio::open_input(&op).unwrap();
    let output = fileio::open_output(&op).unwrap();
    let output2 = match op.out2f.clone() {
        Some(p) => fileio::open_output2(&p).unwrap(),
        None => None,
    };
    let mut eng = CopyEngine::new(op, input, output, output2).unwrap();
    let res = eng.execute();
    (res, eng)
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn write_file(path: &Path, data: &[u8]) {
    fs::write(path, data).unwrap();
}

#[cfg(test)]
mod option_tests {
    use super::*;

    #[test]
    fn test_bs_conflicts_with_ibs_obs() {
        assert!(try_opts(&["--if", "a", "--bs", "512", "--ibs", "512"]).is_err());
        assert!(try_opts(&["--if", "a", "--bs", "512", "--obs", "1024"]).is_err());
    }

    #[test]
    fn test_bpt_alignment_rule() {
        // (ibs*bpt) % obs must be 0 when the block sizes differ
        let err = try_opts(&["--if", "a", "--ibs", "512", "--obs", "1024", "--bpt", "3"]);
        assert!(matches!(err, Err(CopyError::Syntax(_))));
        assert!(try_opts(&["--if", "a", "--ibs", "512", "--obs", "1024", "--bpt", "4"]).is_ok());
    }

    #[test]
    fn test_append_conflicts_with_seek() {
        let err = try_opts(&["--if", "a", "--of", "b", "--oflag", "append", "--seek", "2"]);
        assert!(matches!(err, Err(CopyError::Syntax(_))));
    }

    #[test]
    fn test_bpt_with_obpc_component() {
        let op = opts(&["--if", "a", "--bpt", "64,8"]);
        assert_eq!(op.bpt, 64);
        assert_eq!(op.obpc, 8);
    }

    #[test]
    fn test_protect_parsing() {
        let op = opts(&["--if", "a", "--protect", "2,3"]);
        assert_eq!(op.rdprotect, 2);
        assert_eq!(op.wrprotect, 3);
        assert!(try_opts(&["--if", "a", "--protect", "8"]).is_err());
    }

    #[test]
    fn test_trim_implies_sparse_level_two() {
        let op = opts(&["--if", "a", "--of", "b", "--oflag", "trim"]);
        assert!(op.oflag.wsame16);
        assert_eq!(op.oflag.sparse, 2);
        // sparse defaults the compare granularity to one output block
        assert_eq!(op.obpc, 1);
    }

    #[test]
    fn test_strunc_implies_sparse() {
        let op = opts(&["--if", "a", "--of", "b", "--oflag", "strunc"]);
        assert_eq!(op.oflag.sparse, 1);
    }

    #[test]
    fn test_self_derives_seek_from_skip() {
        let op = opts(&["--if", "a", "--iflag", "self", "--bs", "512", "--skip", "3"]);
        assert!(op.oflag.self_copy);
        assert_eq!(op.outf, "a");
        assert_eq!(op.seek, 3);

        // with different block sizes the translation must be exact
        let op = opts(&[
            "--if", "a", "--iflag", "self", "--ibs", "512", "--obs", "1024", "--bpt", "2",
            "--skip", "4",
        ]);
        assert_eq!(op.seek, 2);
        let err = try_opts(&[
            "--if", "a", "--iflag", "self", "--ibs", "512", "--obs", "1024", "--bpt", "2",
            "--skip", "3",
        ]);
        assert!(matches!(err, Err(CopyError::Syntax(_))));
    }

    #[test]
    fn test_trunc_resume_interaction() {
        let op = opts(&["--if", "a", "--of", "b", "--oflag", "trunc,resume"]);
        assert!(!op.oflag.trunc);
        assert!(op.oflag.resume);
        let err = try_opts(&["--if", "a", "--of", "b", "--oflag", "trunc,sparing"]);
        assert!(matches!(err, Err(CopyError::Syntax(_))));
    }
}

#[cfg(test)]
mod copy_tests {
    use super::*;

    #[test]
    fn test_seed_simple_copy() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_file(&a, &vec![0xAB; 4096]);

        let op = opts(&[
            "--if", a.to_str().unwrap(), "--of", b.to_str().unwrap(), "--bs", "512",
            "--count", "8",
        ]);
        let (res, eng) = run_copy(op);
        res.unwrap();
        assert_eq!(eng.stats.in_full, 8);
        assert_eq!(eng.stats.in_partial, 0);
        assert_eq!(eng.stats.out_full, 8);
        assert_eq!(eng.stats.out_partial, 0);
        assert_eq!(fs::read(&b).unwrap(), vec![0xAB; 4096]);
    }

    #[test]
    fn test_seed_mismatched_block_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let data = patterned(5120);
        write_file(&a, &data);

        let op = opts(&[
            "--if", a.to_str().unwrap(), "--of", b.to_str().unwrap(), "--ibs", "512",
            "--obs", "1024", "--bpt", "4", "--count", "10",
        ]);
        let (res, eng) = run_copy(op);
        res.unwrap();
        assert_eq!(eng.stats.in_full, 10);
        assert_eq!(eng.stats.out_full, 5);
        assert_eq!(fs::read(&b).unwrap(), data);
    }

    #[test]
    fn test_seed_sparse_holes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let mut data = vec![0u8; 2048];
        data[..512].fill(0xFF);
        data[1024..1536].fill(0xFF);
        write_file(&a, &data);

        let op = opts(&[
            "--if", a.to_str().unwrap(), "--of", b.to_str().unwrap(), "--bs", "512",
            "--oflag", "sparse", "--count", "4",
        ]);
        let (res, eng) = run_copy(op);
        res.unwrap();
        assert_eq!(eng.stats.out_full, 2);
        assert_eq!(eng.stats.out_sparse, 2);
        let written = fs::read(&b).unwrap();
        assert_eq!(written.len(), 2048);
        assert_eq!(written, data);
        // volume accounting balances: read bytes equal written plus elided
        assert_eq!(
            eng.stats.in_full * 512,
            eng.stats.out_full * 512 + eng.stats.out_sparse * 512
        );
    }

    #[test]
    fn test_seed_coe_zero_fill() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let data = patterned(2048);
        write_file(&a, &data);

        let op = opts(&[
            "--if", a.to_str().unwrap(), "--of", b.to_str().unwrap(), "--bs", "512",
            "--iflag", "coe", "--count", "4",
        ]);
        let file = fs::File::open(&a).unwrap();
        let input = Side {
            kind: FileKind::Regular,
            stream: Some(ByteStream::Faulty(FaultyFile {
                file,
                bad: vec![1024..1536],
            })),
            pt: None,
        };
        let output = fileio::open_output(&op).unwrap();
        let mut eng = CopyEngine::new(op, input, output, None).unwrap();
        eng.execute().unwrap();

        assert_eq!(eng.stats.in_full, 3);
        assert_eq!(eng.stats.in_partial, 1);
        assert_eq!(eng.stats.unrecovered_errs, 1);
        assert_eq!(eng.stats.coe.lowest_unrecovered, 2);
        assert_eq!(eng.stats.coe.highest_unrecovered, 2);
        let written = fs::read(&b).unwrap();
        assert_eq!(&written[..1024], &data[..1024]);
        assert_eq!(&written[1024..1536], &[0u8; 512]);
        assert_eq!(&written[1536..], &data[1536..]);
    }

    #[test]
    fn test_coe_limit_exceeded_is_medium_error() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_file(&a, &patterned(2560));

        let op = opts(&[
            "--if", a.to_str().unwrap(), "--of", b.to_str().unwrap(), "--bs", "512",
            "--iflag", "coe", "--coe-limit", "1", "--count", "5",
        ]);
        let file = fs::File::open(&a).unwrap();
        let input = Side {
            kind: FileKind::Regular,
            stream: Some(ByteStream::Faulty(FaultyFile {
                file,
                // two consecutive unreadable blocks
                bad: vec![1024..2048],
            })),
            pt: None,
        };
        let output = fileio::open_output(&op).unwrap();
        let mut eng = CopyEngine::new(op, input, output, None).unwrap();
        let err = eng.execute().unwrap_err();
        assert!(matches!(err, CopyError::MediumHard(_)));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_coe_count_resets_on_good_read() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let data = patterned(3072);
        write_file(&a, &data);

        let op = opts(&[
            "--if", a.to_str().unwrap(), "--of", b.to_str().unwrap(), "--bs", "512",
            "--iflag", "coe", "--coe-limit", "1", "--count", "6",
        ]);
        let file = fs::File::open(&a).unwrap();
        let input = Side {
            kind: FileKind::Regular,
            stream: Some(ByteStream::Faulty(FaultyFile {
                file,
                // bad blocks 2 and 4, readable block between them
                bad: vec![1024..1536, 2048..2560],
            })),
            pt: None,
        };
        let output = fileio::open_output(&op).unwrap();
        let mut eng = CopyEngine::new(op, input, output, None).unwrap();
        eng.execute().unwrap();
        assert_eq!(eng.stats.unrecovered_errs, 2);
        assert_eq!(eng.stats.coe.lowest_unrecovered, 2);
        assert_eq!(eng.stats.coe.highest_unrecovered, 4);
        let written = fs::read(&b).unwrap();
        assert_eq!(&written[1536..2048], &data[1536..2048]);
        assert_eq!(&written[2048..2560], &[0u8; 512]);
    }

    #[test]
    fn test_seed_resume() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let data = patterned(2048);
        write_file(&a, &data);
        write_file(&b, &data[..1024]);

        let op = opts(&[
            "--if", a.to_str().unwrap(), "--of", b.to_str().unwrap(), "--bs", "512",
            "--bpt", "2", "--count", "4", "--oflag", "resume",
        ]);
        let (res, eng) = run_copy(op);
        res.unwrap();
        // only the last two blocks were read and written
        assert_eq!(eng.stats.in_full, 2);
        assert_eq!(eng.stats.out_full, 2);
        assert_eq!(eng.op.skip, 4);
        assert_eq!(eng.op.seek, 4);
        assert_eq!(fs::read(&b).unwrap(), data);
    }

    #[test]
    fn test_resume_complete_copy_exits_clean() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let data = patterned(2048);
        write_file(&a, &data);
        write_file(&b, &data);

        let op = opts(&[
            "--if", a.to_str().unwrap(), "--of", b.to_str().unwrap(), "--bs", "512",
            "--bpt", "2", "--count", "4", "--oflag", "resume",
        ]);
        let (res, eng) = run_copy(op);
        res.unwrap();
        assert_eq!(eng.stats.in_full, 0);
        assert_eq!(eng.stats.out_full, 0);
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        let data = patterned(8192);
        write_file(&a, &data);

        let op = opts(&[
            "--if", a.to_str().unwrap(), "--of", b.to_str().unwrap(), "--ibs", "512",
            "--obs", "2048", "--bpt", "4",
        ]);
        run_copy(op).0.unwrap();
        let op = opts(&[
            "--if", b.to_str().unwrap(), "--of", c.to_str().unwrap(), "--ibs", "512",
            "--obs", "2048", "--bpt", "4",
        ]);
        run_copy(op).0.unwrap();
        assert_eq!(fs::read(&c).unwrap(), data);
    }

    #[test]
    fn test_zero_count_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_file(&a, &patterned(4096));

        let op = opts(&[
            "--if", a.to_str().unwrap(), "--of", b.to_str().unwrap(), "--bs", "512",
            "--count", "0",
        ]);
        let (res, eng) = run_copy(op);
        res.unwrap();
        assert_eq!(eng.stats.in_full, 0);
        assert_eq!(eng.stats.out_full, 0);
        assert_eq!(fs::read(&b).unwrap().len(), 0);
    }

    #[test]
    fn test_count_derived_from_input_size() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let data = patterned(2048);
        write_file(&a, &data);

        let op = opts(&["--if", a.to_str().unwrap(), "--of", b.to_str().unwrap(), "--bs", "512"]);
        let (res, eng) = run_copy(op);
        res.unwrap();
        assert_eq!(eng.stats.in_full, 4);
        assert_eq!(fs::read(&b).unwrap(), data);
    }

    #[test]
    fn test_count_derivation_scales_by_skip_and_seek() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let data = patterned(4096);
        write_file(&a, &data);

        let op = opts(&[
            "--if", a.to_str().unwrap(), "--of", b.to_str().unwrap(), "--bs", "512",
            "--skip", "6",
        ]);
        let (res, eng) = run_copy(op);
        res.unwrap();
        assert_eq!(eng.stats.in_full, 2);
        assert_eq!(fs::read(&b).unwrap(), &data[3072..]);
    }

    #[test]
    fn test_skip_beyond_input_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_file(&a, &patterned(1024));

        let op = opts(&[
            "--if", a.to_str().unwrap(), "--of", b.to_str().unwrap(), "--bs", "512",
            "--skip", "10",
        ]);
        let input = fileio::open_input(&op).unwrap();
        let output = fileio::open_output(&op).unwrap();
        assert!(CopyEngine::new(op, input, output, None).is_err());
    }

    #[test]
    fn test_trailing_partial_block() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let data = patterned(1000);
        write_file(&a, &data);

        let op = opts(&["--if", a.to_str().unwrap(), "--of", b.to_str().unwrap(), "--bs", "512"]);
        let (res, eng) = run_copy(op);
        res.unwrap();
        assert_eq!(eng.stats.in_full, 1);
        assert_eq!(eng.stats.in_partial, 1);
        assert_eq!(eng.stats.out_full, 1);
        assert_eq!(eng.stats.out_partial, 1);
        assert_eq!(fs::read(&b).unwrap(), data);
    }

    #[test]
    fn test_secondary_output_gets_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let b2 = dir.path().join("b2");
        let data = patterned(4096);
        write_file(&a, &data);

        let op = opts(&[
            "--if", a.to_str().unwrap(), "--of", b.to_str().unwrap(), "--of2",
            b2.to_str().unwrap(), "--bs", "512", "--count", "8",
        ]);
        let (res, _) = run_copy(op);
        res.unwrap();
        assert_eq!(fs::read(&b).unwrap(), data);
        assert_eq!(fs::read(&b2).unwrap(), data);
    }

    #[test]
    fn test_sparing_skips_identical_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let data = patterned(2048);
        write_file(&a, &data);
        let mut existing = data.clone();
        existing[512..1024].fill(0x77);
        write_file(&b, &existing);

        let op = opts(&[
            "--if", a.to_str().unwrap(), "--of", b.to_str().unwrap(), "--bs", "512",
            "--oflag", "sparing", "--count", "4",
        ]);
        let (res, eng) = run_copy(op);
        res.unwrap();
        // only the one differing block was rewritten
        assert_eq!(eng.stats.out_full, 1);
        assert_eq!(eng.stats.out_sparse, 3);
        assert_eq!(fs::read(&b).unwrap(), data);
    }

    #[test]
    fn test_sparing_identical_chunk_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let data = patterned(2048);
        write_file(&a, &data);
        write_file(&b, &data);

        let op = opts(&[
            "--if", a.to_str().unwrap(), "--of", b.to_str().unwrap(), "--bs", "512",
            "--oflag", "sparing", "--count", "4",
        ]);
        let (res, eng) = run_copy(op);
        res.unwrap();
        assert_eq!(eng.stats.out_full, 0);
        assert_eq!(eng.stats.out_sparse, 4);
        assert_eq!(fs::read(&b).unwrap(), data);
    }

    #[test]
    fn test_dev_null_output_counts_input_only() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        write_file(&a, &patterned(4096));

        let op = opts(&["--if", a.to_str().unwrap(), "--of", ".", "--bs", "512"]);
        let (res, eng) = run_copy(op);
        res.unwrap();
        assert_eq!(eng.stats.in_full, 8);
        // out_full deliberately stays at zero for the null device
        assert_eq!(eng.stats.out_full, 0);
    }

    #[test]
    fn test_self_copy_single_block_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let data = patterned(2048);
        write_file(&a, &data);

        // src and dst are the same file and the derived seek equals skip,
        // so the block lands exactly where it came from
        let op = opts(&[
            "--if", a.to_str().unwrap(), "--iflag", "self", "--bs", "512", "--skip", "1",
            "--count", "1",
        ]);
        assert_eq!(op.outf, a.to_str().unwrap());
        let (res, eng) = run_copy(op);
        res.unwrap();
        assert_eq!(eng.stats.in_full, 1);
        assert_eq!(eng.stats.out_full, 1);
        assert_eq!(fs::read(&a).unwrap(), data);
    }

    #[test]
    fn test_seek_leaves_hole_before_output() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let data = patterned(1024);
        write_file(&a, &data);

        let op = opts(&[
            "--if", a.to_str().unwrap(), "--of", b.to_str().unwrap(), "--bs", "512",
            "--seek", "2", "--count", "2",
        ]);
        let (res, _) = run_copy(op);
        res.unwrap();
        let written = fs::read(&b).unwrap();
        assert_eq!(written.len(), 2048);
        assert_eq!(&written[..1024], &[0u8; 1024]);
        assert_eq!(&written[1024..], &data[..]);
    }
}

#[cfg(test)]
mod pt_tests {
    use super::*;
    use crate::pt::{PtCapacity, PtPort, PtRead, PtStatus};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct MockState {
        data: Vec<u8>,
        trims: Vec<(i64, i32)>,
        syncs: usize,
    }

    /// In-memory pass-through device with injectable unreadable LBAs, a
    /// one-shot unit attention and a forced write status.
    struct MockPt {
        st: Arc<Mutex<MockState>>,
        block_size: i32,
        bad_lbas: Vec<i64>,
        ua_before_read: i32,
        write_status: PtStatus,
    }

    impl MockPt {
        fn new(st: Arc<Mutex<MockState>>, block_size: i32) -> MockPt {
            MockPt {
                st,
                block_size,
                bad_lbas: Vec::new(),
                ua_before_read: 0,
                write_status: PtStatus::Good,
            }
        }
    }

    impl PtPort for MockPt {
        fn read_capacity(&mut self) -> crate::error::Result<PtCapacity> {
            let st = self.st.lock().unwrap();
            Ok(PtCapacity {
                num_blocks: st.data.len() as i64 / self.block_size as i64,
                block_size: self.block_size,
                prot_type: 0,
                p_i_exp: 0,
            })
        }

        fn read(&mut self, lba: i64, blocks: i32, buf: &mut [u8]) -> crate::error::Result<PtRead> {
            if self.ua_before_read > 0 {
                self.ua_before_read -= 1;
                return Ok(PtRead {
                    blocks: 0,
                    resid: blocks * self.block_size,
                    status: PtStatus::UnitAttention,
                });
            }
            let st = self.st.lock().unwrap();
            let bs = self.block_size as usize;
            let total = (st.data.len() / bs) as i64;
            let mut got = 0;
            for k in 0..blocks {
                let cur = lba + k as i64;
                if self.bad_lbas.contains(&cur) {
                    return Ok(PtRead {
                        blocks: got,
                        resid: (blocks - got) * self.block_size,
                        status: PtStatus::MediumHard,
                    });
                }
                if cur >= total {
                    break;
                }
                let off = cur as usize * bs;
                let dst = k as usize * bs;
                buf[dst..dst + bs].copy_from_slice(&st.data[off..off + bs]);
                got += 1;
            }
            Ok(PtRead {
                blocks: got,
                resid: (blocks - got) * self.block_size,
                status: PtStatus::Good,
            })
        }

        fn write(&mut self, lba: i64, blocks: i32, buf: &[u8]) -> crate::error::Result<PtStatus> {
            if self.write_status != PtStatus::Good {
                return Ok(self.write_status);
            }
            let mut st = self.st.lock().unwrap();
            let bs = self.block_size as usize;
            let start = lba as usize * bs;
            let end = start + blocks as usize * bs;
            if st.data.len() < end {
                st.data.resize(end, 0);
            }
            st.data[start..end].copy_from_slice(&buf[..blocks as usize * bs]);
            Ok(PtStatus::Good)
        }

        fn write_same(
            &mut self,
            lba: i64,
            blocks: i32,
            block: &[u8],
        ) -> crate::error::Result<PtStatus> {
            let mut st = self.st.lock().unwrap();
            st.trims.push((lba, blocks));
            let bs = self.block_size as usize;
            let end = (lba as usize + blocks as usize) * bs;
            if st.data.len() < end {
                st.data.resize(end, 0);
            }
            for k in 0..blocks as usize {
                let off = (lba as usize + k) * bs;
                st.data[off..off + bs].copy_from_slice(&block[..bs]);
            }
            Ok(PtStatus::Good)
        }

        fn sync_cache(&mut self) -> crate::error::Result<PtStatus> {
            self.st.lock().unwrap().syncs += 1;
            Ok(PtStatus::Good)
        }
    }

    fn pt_state(data: Vec<u8>) -> Arc<Mutex<MockState>> {
        Arc::new(Mutex::new(MockState {
            data,
            ..Default::default()
        }))
    }

    #[test]
    fn test_pt_input_to_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let b = dir.path().join("b");
        let data = patterned(4096);
        let st = pt_state(data.clone());

        let op = opts(&["--if", "/dev/sg9", "--of", b.to_str().unwrap(), "--bs", "512",
            "--count", "8"]);
        let input = Side::from_port(Box::new(MockPt::new(st.clone(), 512)));
        let output = fileio::open_output(&op).unwrap();
        let mut eng = CopyEngine::new(op, input, output, None).unwrap();
        eng.execute().unwrap();
        assert_eq!(eng.stats.in_full, 8);
        assert_eq!(eng.stats.out_full, 8);
        assert_eq!(fs::read(&b).unwrap(), data);
    }

    #[test]
    fn test_pt_short_read_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let b = dir.path().join("b");
        let data = patterned(3 * 512);
        let st = pt_state(data.clone());

        // device only has 3 blocks but 8 were asked for
        let op = opts(&["--if", "/dev/sg9", "--of", b.to_str().unwrap(), "--bs", "512",
            "--count", "8"]);
        let input = Side::from_port(Box::new(MockPt::new(st, 512)));
        let output = fileio::open_output(&op).unwrap();
        let mut eng = CopyEngine::new(op, input, output, None).unwrap();
        eng.execute().unwrap();
        assert_eq!(eng.stats.in_full, 3);
        assert_eq!(eng.stats.out_full, 3);
        assert_eq!(fs::read(&b).unwrap(), data);
    }

    #[test]
    fn test_pt_unit_attention_retried() {
        let dir = tempfile::tempdir().unwrap();
        let b = dir.path().join("b");
        let st = pt_state(patterned(2048));

        let op = opts(&["--if", "/dev/sg9", "--of", b.to_str().unwrap(), "--bs", "512",
            "--count", "4", "--retries", "1"]);
        let mut port = MockPt::new(st, 512);
        port.ua_before_read = 1;
        let input = Side::from_port(Box::new(port));
        let output = fileio::open_output(&op).unwrap();
        let mut eng = CopyEngine::new(op, input, output, None).unwrap();
        eng.execute().unwrap();
        assert_eq!(eng.stats.num_retries, 1);
        assert_eq!(eng.stats.in_full, 4);
    }

    #[test]
    fn test_pt_unit_attention_without_retries_fails() {
        let dir = tempfile::tempdir().unwrap();
        let b = dir.path().join("b");
        let st = pt_state(patterned(2048));

        let op = opts(&["--if", "/dev/sg9", "--of", b.to_str().unwrap(), "--bs", "512",
            "--count", "4"]);
        let mut port = MockPt::new(st, 512);
        port.ua_before_read = 1;
        let input = Side::from_port(Box::new(port));
        let output = fileio::open_output(&op).unwrap();
        let mut eng = CopyEngine::new(op, input, output, None).unwrap();
        let err = eng.execute().unwrap_err();
        assert!(matches!(err, CopyError::UnitAttention(_)));
        assert_eq!(err.exit_code(), 6);
    }

    #[test]
    fn test_pt_medium_error_keeps_partial_data() {
        let dir = tempfile::tempdir().unwrap();
        let b = dir.path().join("b");
        let data = patterned(4096);
        let st = pt_state(data.clone());

        let op = opts(&["--if", "/dev/sg9", "--of", b.to_str().unwrap(), "--bs", "512",
            "--count", "8"]);
        let mut port = MockPt::new(st, 512);
        port.bad_lbas = vec![4];
        let input = Side::from_port(Box::new(port));
        let output = fileio::open_output(&op).unwrap();
        let mut eng = CopyEngine::new(op, input, output, None).unwrap();
        let err = eng.execute().unwrap_err();
        assert!(matches!(err, CopyError::MediumHard(_)));
        // the four good blocks before the error were still written
        assert_eq!(eng.stats.in_full, 4);
        assert_eq!(eng.stats.out_full, 4);
        assert_eq!(fs::read(&b).unwrap(), &data[..2048]);
    }

    #[test]
    fn test_pt_output_trim_runs() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let mut data = vec![0u8; 2048];
        data[..512].fill(0xFF);
        data[1536..].fill(0xEE);
        write_file(&a, &data);
        let st = pt_state(vec![0x55; 2048]);

        let op = opts(&["--if", a.to_str().unwrap(), "--of", "/dev/sg9", "--bs", "512",
            "--count", "4", "--oflag", "trim"]);
        let input = fileio::open_input(&op).unwrap();
        let output = Side::from_port(Box::new(MockPt::new(st.clone(), 512)));
        let mut eng = CopyEngine::new(op, input, output, None).unwrap();
        eng.execute().unwrap();

        assert_eq!(eng.stats.out_full, 2);
        assert_eq!(eng.stats.out_sparse, 2);
        let st = st.lock().unwrap();
        // the middle zero run was trimmed with one WRITE SAME
        assert_eq!(st.trims, vec![(1, 2)]);
        assert_eq!(st.data, data);
    }

    #[test]
    fn test_pt_output_all_zero_chunk_trimmed_whole() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        write_file(&a, &vec![0u8; 2048]);
        let st = pt_state(vec![0x55; 2048]);

        let op = opts(&["--if", a.to_str().unwrap(), "--of", "/dev/sg9", "--bs", "512",
            "--count", "4", "--oflag", "trim"]);
        let input = fileio::open_input(&op).unwrap();
        let output = Side::from_port(Box::new(MockPt::new(st.clone(), 512)));
        let mut eng = CopyEngine::new(op, input, output, None).unwrap();
        eng.execute().unwrap();

        assert_eq!(eng.stats.out_full, 0);
        assert_eq!(eng.stats.out_sparse, 4);
        let st = st.lock().unwrap();
        assert_eq!(st.trims, vec![(0, 4)]);
        assert_eq!(st.data, vec![0u8; 2048]);
    }

    #[test]
    fn test_pt_write_protection_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        write_file(&a, &patterned(2048));
        let st = pt_state(vec![0u8; 2048]);

        let op = opts(&["--if", a.to_str().unwrap(), "--of", "/dev/sg9", "--bs", "512",
            "--count", "4"]);
        let input = fileio::open_input(&op).unwrap();
        let mut port = MockPt::new(st, 512);
        port.write_status = PtStatus::Protection;
        let output = Side::from_port(Box::new(port));
        let mut eng = CopyEngine::new(op, input, output, None).unwrap();
        let err = eng.execute().unwrap_err();
        assert!(matches!(err, CopyError::Protection));
        assert_eq!(err.exit_code(), 10);
    }

    #[test]
    fn test_pt_ssync_issues_sync_cache() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        write_file(&a, &patterned(1024));
        let st = pt_state(vec![0u8; 1024]);

        let op = opts(&["--if", a.to_str().unwrap(), "--of", "/dev/sg9", "--bs", "512",
            "--count", "2", "--oflag", "ssync"]);
        let input = fileio::open_input(&op).unwrap();
        let output = Side::from_port(Box::new(MockPt::new(st.clone(), 512)));
        let mut eng = CopyEngine::new(op, input, output, None).unwrap();
        eng.execute().unwrap();
        assert_eq!(st.lock().unwrap().syncs, 1);
    }
}
