use std::time::{Duration, Instant};

use lockstep_graph::{
    buffer::AudioSegment,
    time::{round_up_to_block, GraphTime},
    AddTrackFlags, Graph, Options,
};
use proptest::prelude::*;

fn run_to(graph: &Graph, ticks: GraphTime, end: GraphTime) {
    graph.commit_changes().unwrap();
    graph.start_non_realtime_processing(ticks).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        graph.update_main_thread_state();
        if graph.state_computed_time() >= end {
            break;
        }
        assert!(Instant::now() < deadline, "graph stalled");
        std::thread::sleep(Duration::from_millis(1));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn finished_sources_end_blocked_at_their_duration(
        frames in 1usize..6000,
        budgets in prop::collection::vec(1i64..3000, 1..6),
    ) {
        let graph = Graph::new(Options::non_realtime(48_000)).unwrap();
        let source = graph.create_source_stream();
        let input = source.input();
        input
            .add_track(1, 0, AudioSegment::from_planar(vec![vec![0.5; frames]]), AddTrackFlags::NONE)
            .unwrap();
        input.end_track(1).unwrap();
        input.finish().unwrap();

        let mut end = 0;
        for ticks in budgets {
            end += round_up_to_block(ticks, 128);
            run_to(&graph, ticks, end);
            prop_assert_eq!(graph.state_computed_time() % 128, 0);
            if source.is_finished() {
                prop_assert!(source.is_blocked());
            }
        }
        let tail = 6144 + 1024;
        run_to(&graph, tail, end + tail);
        run_to(&graph, 128, end + tail + 128);
        prop_assert!(source.is_finished());
        prop_assert!(source.is_blocked());
        prop_assert_eq!(source.current_time(), frames as i64);
    }
}
