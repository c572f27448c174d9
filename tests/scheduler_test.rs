//! Integration tests for the continuous-batching scheduler.
//!
//! These drive the scheduler directly with hand-built sequence groups, the
//! way the pipeline does, and pin down the block-accounting behavior both
//! batching policies must exhibit.

mod common;

use common::{append_and_finish, finish_iteration};
use nano_batch::config;
use nano_batch::core::sequence::{SequenceGroup, SequenceStatus};
use nano_batch::scheduler::Scheduler;
use nano_batch::SchedulerConfig;

fn test_config(dynamic_split_fuse: bool) -> SchedulerConfig {
    SchedulerConfig {
        max_num_batched_tokens: 32,
        num_kv_blocks: 6,
        block_size: 4,
        dynamic_split_fuse,
        max_num_seqs: 5,
        enable_prefix_caching: false,
    }
}

fn greedy_group(request_id: u64, prompt: Vec<u32>, block_size: usize) -> SequenceGroup {
    let mut group = SequenceGroup::new(request_id, prompt, config::greedy(), block_size);
    group.set_arrival(request_id);
    group
}

#[test]
fn general_three_groups_fill_the_cache() {
    for dynamic_split_fuse in [false, true] {
        let config = test_config(dynamic_split_fuse);
        let mut scheduler = Scheduler::new(config);
        let tokens: Vec<u32> = (0..8).collect();
        let mut requests: Vec<SequenceGroup> = (0..3)
            .map(|i| greedy_group(i, tokens.clone(), 4))
            .collect();

        // All three 8-token prompts fit: 2 blocks each, 24 tokens total.
        let out1 = scheduler.schedule(&mut requests);
        assert_eq!(out1.scheduled_group_ids, vec![0, 1, 2]);
        assert_eq!(out1.total_num_scheduled_tokens, 24);
        assert_eq!(out1.is_prompt, !dynamic_split_fuse);
        for group in &requests {
            let seq_id = group.sequences()[0].seq_id();
            assert_eq!(scheduler.get_block_table(seq_id).unwrap().len(), 2);
        }
        assert_eq!(scheduler.num_free_blocks(), 0);
        append_and_finish(&mut requests, &out1, 16);

        // Every group needs a third block for its next token, but the pool
        // is exhausted: the latest-arrived group is preempted.
        let out2 = scheduler.schedule(&mut requests);
        assert_eq!(out2.scheduled_group_ids, vec![0, 1]);
        assert_eq!(out2.total_num_scheduled_tokens, 2);
        assert!(!out2.is_prompt);
        assert_eq!(out2.preempted_group_ids, vec![2]);

        let seq0 = requests[0].sequences()[0].seq_id();
        let seq1 = requests[1].sequences()[0].seq_id();
        let seq2 = requests[2].sequences()[0].seq_id();
        if dynamic_split_fuse {
            // Split-fuse trims the victim block by block before giving up,
            // so its trailing block frees first.
            assert_eq!(scheduler.get_block_table(seq0).unwrap(), vec![0, 1, 5]);
            assert_eq!(scheduler.get_block_table(seq1).unwrap(), vec![2, 3, 4]);
        } else {
            // The whole-prompt policy escalates straight to full preemption.
            assert_eq!(scheduler.get_block_table(seq0).unwrap(), vec![0, 1, 4]);
            assert_eq!(scheduler.get_block_table(seq1).unwrap(), vec![2, 3, 5]);
        }
        // Preemption released everything the victim held.
        assert!(!scheduler.has_block_table(seq2));
        assert!(requests[2].is_waiting());
        assert_eq!(requests[2].num_processed_tokens(), 0);
        append_and_finish(&mut requests, &out2, 16);

        // Finish the first group; its blocks return to the pool and the
        // preempted group is readmitted with its generated token intact.
        for seq in requests[0].sequences_mut() {
            seq.set_finished(nano_batch::core::sequence::GenerationFinishReason::Stop);
        }
        scheduler.free_sequence(seq0);
        requests.remove(0);

        let out3 = scheduler.schedule(&mut requests);
        let readmitted: Vec<u64> = out3.scheduled_group_ids.clone();
        if dynamic_split_fuse {
            // Split-fuse mixes the recompute with the other group's token.
            assert_eq!(readmitted, vec![1, 2]);
            assert_eq!(out3.total_num_scheduled_tokens, 1 + 9);
            assert_eq!(scheduler.get_block_table(seq2).unwrap(), vec![0, 1, 5]);
        } else {
            // Whole-prompt policy readmits in a prompt-only step.
            assert_eq!(readmitted, vec![2]);
            assert_eq!(out3.total_num_scheduled_tokens, 9);
            assert!(out3.is_prompt);
            assert_eq!(scheduler.get_block_table(seq2).unwrap(), vec![0, 1, 4]);
        }
    }
}

#[test]
fn append_slots_considers_all_sequences() {
    for dynamic_split_fuse in [false, true] {
        let mut config = test_config(dynamic_split_fuse);
        config.num_kv_blocks = 5;
        let mut scheduler = Scheduler::new(config);
        let tokens: Vec<u32> = (0..8).collect();
        let mut requests: Vec<SequenceGroup> = (0..2)
            .map(|i| greedy_group(i, tokens.clone(), 4))
            .collect();

        let out1 = scheduler.schedule(&mut requests);
        assert_eq!(out1.scheduled_group_ids, vec![0, 1]);
        assert_eq!(out1.total_num_scheduled_tokens, 16);
        let seq0 = requests[0].sequences()[0].seq_id();
        let seq1 = requests[1].sequences()[0].seq_id();
        assert_eq!(scheduler.get_block_table(seq0).unwrap(), vec![0, 1]);
        assert_eq!(scheduler.get_block_table(seq1).unwrap(), vec![2, 3]);
        append_and_finish(&mut requests, &out1, 16);

        // Both groups need a new block, but only one is free. The earlier
        // group wins it; the later one simply sits the step out, because a
        // group already in the batch is never preempted for a later one.
        let out2 = scheduler.schedule(&mut requests);
        assert_eq!(out2.scheduled_group_ids, vec![0]);
        assert_eq!(out2.total_num_scheduled_tokens, 1);
        assert_eq!(scheduler.get_block_table(seq0).unwrap(), vec![0, 1, 4]);
        assert_eq!(scheduler.get_block_table(seq1).unwrap(), vec![2, 3]);
        assert!(requests[1].is_running());
    }
}

#[test]
fn partial_preemption_rewinds_one_block() {
    for dynamic_split_fuse in [false, true] {
        let config = test_config(dynamic_split_fuse);
        let mut scheduler = Scheduler::new(config);
        let mut requests = vec![
            greedy_group(0, (0..11).collect(), 4),
            greedy_group(1, (0..8).collect(), 4),
        ];

        // Prompts: 3 blocks + 2 blocks, one block left over.
        let out0 = scheduler.schedule(&mut requests);
        assert_eq!(out0.total_num_scheduled_tokens, 19);
        append_and_finish(&mut requests, &out0, 16);

        // Generate: the second group grows into the last free block.
        let out1 = scheduler.schedule(&mut requests);
        assert_eq!(out1.scheduled_group_ids, vec![0, 1]);
        let seq1 = requests[1].sequences()[0].seq_id();
        assert_eq!(scheduler.get_block_table(seq1).unwrap(), vec![3, 4, 5]);
        append_and_finish(&mut requests, &out1, 16);

        // Now the first group needs a fourth block. The second group loses
        // its trailing block and rewinds to the block boundary.
        let out2 = scheduler.schedule(&mut requests);
        assert_eq!(out2.scheduled_group_ids, vec![0]);
        assert_eq!(out2.total_num_scheduled_tokens, 1);
        assert_eq!(out2.preempted_group_ids, vec![1]);
        let seq0 = requests[0].sequences()[0].seq_id();
        assert_eq!(scheduler.get_block_table(seq0).unwrap(), vec![0, 1, 2, 5]);
        assert_eq!(scheduler.get_block_table(seq1).unwrap(), vec![3, 4]);
        assert_eq!(requests[1].num_processed_tokens(), 8);
        assert!(requests[1].is_running());
        append_and_finish(&mut requests, &out2, 16);

        // Release the first group; the rewound suffix is re-streamed.
        scheduler.free_sequence(seq0);
        requests.remove(0);
        let out3 = scheduler.schedule(&mut requests);
        assert_eq!(out3.total_num_scheduled_tokens, 1);
        assert_eq!(scheduler.get_block_table(seq1).unwrap(), vec![3, 4, 0]);
    }
}

#[test]
fn partially_preempted_prompt() {
    for dynamic_split_fuse in [false, true] {
        let config = test_config(dynamic_split_fuse);
        let mut scheduler = Scheduler::new(config);
        let tokens: Vec<u32> = (0..12).collect();
        let mut requests: Vec<SequenceGroup> = (0..2)
            .map(|i| greedy_group(i, tokens.clone(), 4))
            .collect();

        // Two 12-token prompts use all six blocks.
        let out1 = scheduler.schedule(&mut requests);
        assert_eq!(out1.total_num_scheduled_tokens, 24);
        assert_eq!(scheduler.num_free_blocks(), 0);
        append_and_finish(&mut requests, &out1, 16);

        // The first group's next token forces preemption of the second,
        // whose processed tokens still sit inside its prompt.
        let out2 = scheduler.schedule(&mut requests);
        assert_eq!(out2.scheduled_group_ids, vec![0]);
        assert_eq!(out2.total_num_scheduled_tokens, 1);
        let seq0 = requests[0].sequences()[0].seq_id();
        let seq1 = requests[1].sequences()[0].seq_id();

        if dynamic_split_fuse {
            // Split-fuse can re-stream a prompt suffix: the victim keeps
            // two blocks and rewinds to the boundary.
            assert!(scheduler.has_block_table(seq1));
            assert_eq!(scheduler.get_block_table(seq1).unwrap().len(), 2);
            assert_eq!(requests[1].num_processed_tokens(), 8);
            assert_eq!(scheduler.get_block_table(seq0).unwrap(), vec![0, 1, 2, 5]);
        } else {
            // The whole-prompt policy cannot re-enter a prompt mid-way:
            // the victim is fully preempted back to waiting.
            assert!(!scheduler.has_block_table(seq1));
            assert!(requests[1].is_waiting());
            assert_eq!(requests[1].num_processed_tokens(), 0);
            assert_eq!(scheduler.get_block_table(seq0).unwrap(), vec![0, 1, 2, 3]);
        }
        append_and_finish(&mut requests, &out2, 16);

        // Finish the first group and readmit the victim.
        scheduler.free_sequence(seq0);
        requests.remove(0);
        let out3 = scheduler.schedule(&mut requests);
        if dynamic_split_fuse {
            // Only the remaining prompt suffix is recomputed.
            assert_eq!(out3.total_num_scheduled_tokens, 4);
        } else {
            // The whole 12-token prompt is recomputed from scratch.
            assert_eq!(out3.total_num_scheduled_tokens, 12);
        }
    }
}

#[test]
fn partial_preemption_disabled_forces_full_preemption() {
    let config = test_config(false);
    let mut scheduler = Scheduler::with_partial_preemption(config, false);
    let mut requests = vec![
        greedy_group(0, (0..11).collect(), 4),
        greedy_group(1, (0..8).collect(), 4),
    ];

    let out0 = scheduler.schedule(&mut requests);
    append_and_finish(&mut requests, &out0, 16);
    let out1 = scheduler.schedule(&mut requests);
    append_and_finish(&mut requests, &out1, 16);

    // Where partial preemption would trim one block, the disabled mode
    // releases everything and sends the victim back to waiting.
    let out2 = scheduler.schedule(&mut requests);
    assert_eq!(out2.scheduled_group_ids, vec![0]);
    let seq1 = requests[1].sequences()[0].seq_id();
    assert!(!scheduler.has_block_table(seq1));
    assert!(requests[1].is_waiting());
    assert_eq!(requests[1].num_processed_tokens(), 0);
    append_and_finish(&mut requests, &out2, 16);

    // Readmission recomputes the entire context, prompt plus the two
    // tokens generated before the preemption.
    let seq0 = requests[0].sequences()[0].seq_id();
    scheduler.free_sequence(seq0);
    requests.remove(0);
    let out3 = scheduler.schedule(&mut requests);
    assert_eq!(out3.total_num_scheduled_tokens, 10);
}

#[test]
fn beam_group_preempted_evenly_without_freeing_shared_blocks() {
    let config = SchedulerConfig {
        max_num_batched_tokens: 32,
        num_kv_blocks: 10,
        block_size: 4,
        dynamic_split_fuse: false,
        max_num_seqs: 8,
        enable_prefix_caching: false,
    };
    let mut scheduler = Scheduler::new(config);

    // A beam group: 4-token prompt, forked into four beams after prefill.
    let mut beam_group = SequenceGroup::new(1, (0..4).collect(), config::beam_search(), 4);
    beam_group.set_arrival(1);
    let mut requests = vec![beam_group];
    let out = scheduler.schedule(&mut requests);
    assert_eq!(out.total_num_scheduled_tokens, 4);
    finish_iteration(&mut requests[0]);

    let parent = requests[0].sequences()[0].seq_id();
    for _ in 0..3 {
        let child = requests[0].fork_sequence(parent).unwrap();
        scheduler.fork_sequence(parent, child);
    }
    assert_eq!(scheduler.block_ref_count(0), 4);

    // Eight generation rounds: every beam grows to three blocks, one
    // shared and two private. Nine blocks in use, one free.
    let mut token = 10;
    for _ in 0..8 {
        let out = scheduler.schedule(&mut requests);
        assert_eq!(out.scheduled_group_ids, vec![1]);
        for seq in requests[0].running_sequences_mut() {
            seq.append_token(token, -0.5);
        }
        token += 1;
        finish_iteration(&mut requests[0]);
    }
    assert_eq!(requests[0].num_processed_tokens(), 12);
    assert_eq!(scheduler.num_free_blocks(), 1);

    // A later greedy request takes priority (placed first in the list) and
    // squeezes the beam group out of the cache.
    let mut greedy = greedy_group(0, (0..4).collect(), 4);
    greedy.set_arrival(2);
    requests.insert(0, greedy);

    let out = scheduler.schedule(&mut requests);
    assert_eq!(out.scheduled_group_ids, vec![0]);
    assert!(out.is_prompt);
    append_and_finish(&mut requests, &out, 42);

    // First squeeze: every beam drops its trailing block, the group
    // rewinds to the eight-token boundary, and the shared prompt block is
    // still referenced by all four beams.
    let out = scheduler.schedule(&mut requests);
    assert_eq!(out.scheduled_group_ids, vec![0]);
    assert_eq!(requests[1].num_processed_tokens(), 8);
    for seq in requests[1].sequences() {
        assert_eq!(scheduler.get_block_table(seq.seq_id()).unwrap().len(), 2);
    }
    assert_eq!(scheduler.block_ref_count(0), 4);
    append_and_finish(&mut requests, &out, 42);

    // Keep growing the greedy request until the beams are squeezed again.
    for _ in 0..20 {
        let out = scheduler.schedule(&mut requests);
        append_and_finish(&mut requests, &out, 42);
    }
    assert_eq!(requests[1].num_processed_tokens(), 4);
    for seq in requests[1].sequences() {
        let table = scheduler.get_block_table(seq.seq_id()).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0], 0);
    }
    assert_eq!(scheduler.block_ref_count(0), 4);
}

#[test]
fn oversized_prompt_is_ignored_with_no_leak() {
    for dynamic_split_fuse in [false, true] {
        let config = test_config(dynamic_split_fuse);
        let mut scheduler = Scheduler::new(config);
        // 30 tokens need 8 blocks; the pool has 6.
        let mut requests = vec![greedy_group(0, (0..30).collect(), 4)];
        let out = scheduler.schedule(&mut requests);
        assert!(out.is_empty());
        assert!(requests[0].is_ignored());
        assert!(requests[0].has_finished());
        assert_eq!(scheduler.num_free_blocks(), 6);
    }
}

#[test]
fn token_budget_bounds_each_step() {
    for dynamic_split_fuse in [false, true] {
        let mut config = test_config(dynamic_split_fuse);
        config.max_num_batched_tokens = 10;
        config.num_kv_blocks = 12;
        let mut scheduler = Scheduler::new(config);
        let mut requests = vec![
            greedy_group(0, (0..8).collect(), 4),
            greedy_group(1, (0..8).collect(), 4),
        ];

        let out1 = scheduler.schedule(&mut requests);
        assert!(out1.total_num_scheduled_tokens <= 10);
        if dynamic_split_fuse {
            // The second prompt is chunked into the leftover budget.
            assert_eq!(out1.scheduled_group_ids, vec![0, 1]);
            assert_eq!(out1.num_scheduled_tokens[&0], 8);
            assert_eq!(out1.num_scheduled_tokens[&1], 2);
        } else {
            // Whole prompts only: the second must wait for the next step.
            assert_eq!(out1.scheduled_group_ids, vec![0]);
        }
        // The first group finished its prompt and sampled a token; the
        // chunked one only advances its prefill progress.
        for seq in requests[0].running_sequences_mut() {
            seq.append_token(16, -0.1);
        }
        finish_iteration(&mut requests[0]);
        finish_iteration(&mut requests[1]);

        if dynamic_split_fuse {
            // The split prompt continues from where its chunk ended.
            assert_eq!(requests[1].num_processed_tokens(), 2);
            let out2 = scheduler.schedule(&mut requests);
            assert!(out2.total_num_scheduled_tokens <= 10);
            assert_eq!(out2.num_scheduled_tokens[&1], 6);
        }
    }
}

#[test]
fn max_num_seqs_bounds_admission() {
    let mut config = test_config(false);
    config.max_num_seqs = 2;
    config.num_kv_blocks = 12;
    let mut scheduler = Scheduler::new(config);
    let mut requests: Vec<SequenceGroup> = (0..4)
        .map(|i| greedy_group(i, (0..4).collect(), 4))
        .collect();

    let out = scheduler.schedule(&mut requests);
    assert_eq!(out.scheduled_group_ids, vec![0, 1]);
    let running: usize = requests.iter().map(|g| g.num_running_seqs()).sum();
    assert_eq!(running, 2);
}

#[test]
fn fifo_admission_order() {
    let mut config = test_config(true);
    config.num_kv_blocks = 32;
    config.max_num_batched_tokens = 256;
    let mut scheduler = Scheduler::new(config);
    let mut requests: Vec<SequenceGroup> = (0..5)
        .map(|i| greedy_group(i, (0..6).collect(), 4))
        .collect();

    let out = scheduler.schedule(&mut requests);
    assert_eq!(out.scheduled_group_ids, vec![0, 1, 2, 3, 4]);
    for group in &requests {
        assert_eq!(
            group.sequences()[0].status(),
            SequenceStatus::Running,
            "group {} should be admitted",
            group.request_id()
        );
    }
}
