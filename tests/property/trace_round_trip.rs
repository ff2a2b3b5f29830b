//! Randomized record/replay round trips.
//!
//! Generates arbitrary interleavings of frames, raw captures, generic
//! records, and task events, writes them through a real trace directory,
//! and checks that replay reproduces every record, that frame times come
//! back as `1..=N`, and that raw headers stay paired with their payloads.

use proptest::collection::vec;
use proptest::prelude::*;

use replay_trace::trace::{
    EncodedEvent, ExtraRegFormat, ExtraRegisters, Registers, SupportedArch, TaskEventKind,
    TraceFrame, TraceLocator, TraceMetadata, TraceReader, TraceWriter,
};

/// Auxiliary records attached to one frame.
#[derive(Clone, Debug)]
enum Aux {
    Raw { tid: i32, addr: u64, data: Vec<u8> },
    Generic(Vec<u8>),
    Task { tid: i32, kind: TaskEventKind },
}

/// One frame's worth of recording: auxiliary records, then the frame.
#[derive(Clone, Debug)]
struct FramePlan {
    tid: i32,
    ticks: u64,
    monotonic_sec: f64,
    exec_regs: Option<(SupportedArch, u8, Vec<u8>)>,
    aux: Vec<Aux>,
}

fn task_kind_strategy() -> impl Strategy<Value = TaskEventKind> {
    prop_oneof![
        (1..10_000i32, 1..10_000i32, any::<u64>()).prop_map(|(parent_tid, own_ns_tid, flags)| {
            TaskEventKind::Clone {
                parent_tid,
                own_ns_tid,
                flags,
            }
        }),
        ("[a-z/]{1,12}", vec("[a-z=-]{0,8}", 0..4)).prop_map(|(file_name, cmd_line)| {
            TaskEventKind::Exec {
                file_name,
                cmd_line,
            }
        }),
        any::<i32>().prop_map(|exit_status| TaskEventKind::Exit { exit_status }),
    ]
}

fn aux_strategy() -> impl Strategy<Value = Aux> {
    prop_oneof![
        (1..10_000i32, any::<u64>(), vec(any::<u8>(), 0..64))
            .prop_map(|(tid, addr, data)| Aux::Raw { tid, addr, data }),
        vec(any::<u8>(), 0..64).prop_map(Aux::Generic),
        (1..10_000i32, task_kind_strategy()).prop_map(|(tid, kind)| Aux::Task { tid, kind }),
    ]
}

fn exec_regs_strategy() -> impl Strategy<Value = Option<(SupportedArch, u8, Vec<u8>)>> {
    proptest::option::of((
        prop_oneof![Just(SupportedArch::X86), Just(SupportedArch::X8664)],
        any::<u8>(),
        vec(any::<u8>(), 0..32),
    ))
}

fn frame_plan_strategy() -> impl Strategy<Value = FramePlan> {
    (
        1..10_000i32,
        any::<u64>(),
        (0u32..1_000_000).prop_map(|n| f64::from(n) / 8.0),
        exec_regs_strategy(),
        vec(aux_strategy(), 0..3),
    )
        .prop_map(|(tid, ticks, monotonic_sec, exec_regs, aux)| FramePlan {
            tid,
            ticks,
            monotonic_sec,
            exec_regs,
            aux,
        })
}

fn build_frame(time: u64, plan: &FramePlan) -> TraceFrame {
    match &plan.exec_regs {
        None => TraceFrame::new(
            time,
            plan.tid,
            EncodedEvent::new(1),
            plan.ticks,
            plan.monotonic_sec,
        ),
        Some((arch, reg_seed, extra)) => {
            let reg_bytes = vec![*reg_seed; arch.user_regs_size()];
            let regs = Registers::from_bytes(*arch, &reg_bytes);
            let extra_regs = if extra.is_empty() {
                ExtraRegisters::empty()
            } else {
                ExtraRegisters::from_raw(ExtraRegFormat::Xsave, extra.clone())
            };
            TraceFrame::with_exec_info(
                time,
                plan.tid,
                EncodedEvent::with_exec_info(1),
                plan.ticks,
                plan.monotonic_sec,
                regs,
                extra_regs,
            )
        }
    }
}

proptest! {
    // Each case spins up a full trace directory with its compression
    // threads, so keep the case count moderate.
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn arbitrary_recordings_replay_exactly(plans in vec(frame_plan_strategy(), 1..8)) {
        let tmp = tempfile::tempdir().unwrap();
        let locator = TraceLocator::new(tmp.path());
        let meta = TraceMetadata { use_file_cloning: false, ..TraceMetadata::default() };
        let mut writer = TraceWriter::create(&locator, "prop", &meta).unwrap();
        let trace_dir = writer.dir().to_path_buf();

        let mut written_frames = Vec::new();
        let mut expected_tasks = Vec::new();
        let mut raw_payload_total = 0usize;
        for plan in &plans {
            let time = writer.time();
            for aux in &plan.aux {
                match aux {
                    Aux::Raw { tid, addr, data } => {
                        raw_payload_total += data.len();
                        writer.write_raw(*tid, *addr, data).unwrap();
                    }
                    Aux::Generic(data) => writer.write_generic(data).unwrap(),
                    Aux::Task { tid, kind } => {
                        expected_tasks.push((time, *tid, kind.clone()));
                        writer.write_task_event(*tid, kind).unwrap();
                    }
                }
            }
            let frame = build_frame(time, plan);
            writer.write_frame(&frame).unwrap();
            written_frames.push(frame);
        }
        prop_assert!(writer.good());
        writer.close().unwrap();

        let mut reader = TraceReader::open(&trace_dir).unwrap();
        let mut replayed_raw_total = 0usize;
        for (index, plan) in plans.iter().enumerate() {
            let frame = reader.read_frame().unwrap();
            // Clock monotonicity: times are exactly 1..=N.
            prop_assert_eq!(frame.time(), index as u64 + 1);
            prop_assert_eq!(&frame, &written_frames[index]);

            let mut expected_raws: Vec<&Aux> = plan
                .aux
                .iter()
                .filter(|aux| matches!(aux, Aux::Raw { .. }))
                .collect();
            expected_raws.reverse();
            while let Some(raw) = reader.read_raw_data_for_frame(&frame).unwrap() {
                match expected_raws.pop() {
                    Some(Aux::Raw { tid, addr, data }) => {
                        prop_assert_eq!(raw.rec_tid, *tid);
                        prop_assert_eq!(raw.addr, *addr);
                        prop_assert_eq!(&raw.data, data);
                        replayed_raw_total += raw.data.len();
                    }
                    _ => prop_assert!(false, "unexpected raw record"),
                }
            }
            prop_assert!(expected_raws.is_empty());

            let mut expected_generics: Vec<&Aux> = plan
                .aux
                .iter()
                .filter(|aux| matches!(aux, Aux::Generic(_)))
                .collect();
            expected_generics.reverse();
            while let Some(data) = reader.read_generic_for_frame(&frame).unwrap() {
                match expected_generics.pop() {
                    Some(Aux::Generic(expected)) => prop_assert_eq!(&data, expected),
                    _ => prop_assert!(false, "unexpected generic record"),
                }
            }
            prop_assert!(expected_generics.is_empty());
        }
        prop_assert!(reader.at_end());
        // Paired streams: every raw byte written came back.
        prop_assert_eq!(replayed_raw_total, raw_payload_total);

        for (time, tid, kind) in &expected_tasks {
            let event = reader.read_task_event().unwrap().unwrap();
            prop_assert_eq!(event.time(), *time);
            prop_assert_eq!(event.tid(), *tid);
            prop_assert_eq!(event.kind(), kind);
        }
        prop_assert_eq!(reader.read_task_event().unwrap(), None);
    }
}
