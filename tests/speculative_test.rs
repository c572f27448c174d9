//! Speculative decoding: accept/reject protocol and its equivalence with
//! plain decoding on the main model.

mod common;

use common::expected_chain;
use nano_batch::config;
use nano_batch::testing::StepModel;
use nano_batch::{
    ContinuousBatchingPipeline, GenerationConfig, GenerationStatus, SchedulerConfig,
    SpeculativeConfig, SpeculativeDecodingPipeline,
};

const VOCAB: u32 = 97;

fn spec_config() -> SchedulerConfig {
    SchedulerConfig {
        max_num_batched_tokens: 64,
        num_kv_blocks: 32,
        block_size: 4,
        dynamic_split_fuse: false,
        max_num_seqs: 4,
        enable_prefix_caching: false,
    }
}

fn greedy_params(max_new_tokens: usize) -> GenerationConfig {
    GenerationConfig {
        max_new_tokens: Some(max_new_tokens),
        ..config::greedy()
    }
}

/// Degenerate case: draft identical to main. Every round accepts all K
/// candidates plus the bonus token.
#[test]
fn identical_draft_concentrates_histogram_at_k_plus_one() {
    let k = 3;
    let mut pipeline = SpeculativeDecodingPipeline::new(
        Box::new(StepModel::new(VOCAB as usize)),
        Box::new(StepModel::new(VOCAB as usize)),
        spec_config(),
        SpeculativeConfig::new(k),
    );
    // 13 tokens: one from the prompt pass, then three rounds of K+1.
    let result = pipeline.generate(&[5], &greedy_params(13)).unwrap();

    assert_eq!(result.status, GenerationStatus::Finished);
    assert_eq!(result.generation_ids[0], expected_chain(5, VOCAB, 13));

    let histogram = pipeline.hit_histogram();
    assert_eq!(histogram[k + 1], 3);
    for (bucket, &count) in histogram.iter().enumerate() {
        if bucket != k + 1 {
            assert_eq!(count, 0, "unexpected hits in bucket {bucket}");
        }
    }
}

/// The emitted stream always equals what the main model produces alone,
/// regardless of how wrong the draft is.
#[test]
fn divergent_draft_still_matches_main_alone() {
    let max_new = 17;
    let prompt = vec![10u32, 11];

    let mut baseline = ContinuousBatchingPipeline::new(
        Box::new(StepModel::new(VOCAB as usize)),
        spec_config(),
    );
    let expected = baseline
        .generate(&[prompt.clone()], &[greedy_params(max_new)], None)
        .unwrap();

    // A draft with a different successor rule disagrees immediately.
    let mut pipeline = SpeculativeDecodingPipeline::new(
        Box::new(StepModel::new(VOCAB as usize)),
        Box::new(StepModel::with_rule(VOCAB as usize, 1, 2)),
        spec_config(),
        SpeculativeConfig::new(4),
    );
    let result = pipeline.generate(&prompt, &greedy_params(max_new)).unwrap();

    assert_eq!(result.generation_ids[0], expected[0].generation_ids[0]);
    // Rounds exist, and none of them accepted everything.
    let histogram = pipeline.hit_histogram();
    assert!(histogram.iter().sum::<usize>() > 0);
    assert_eq!(histogram[5], 0);
}

#[test]
fn eos_inside_accepted_candidates_stops_the_stream() {
    let params = GenerationConfig {
        max_new_tokens: Some(30),
        ignore_eos: false,
        eos_token_id: Some(9),
        ..config::greedy()
    };
    let mut pipeline = SpeculativeDecodingPipeline::new(
        Box::new(StepModel::new(VOCAB as usize)),
        Box::new(StepModel::new(VOCAB as usize)),
        spec_config(),
        SpeculativeConfig::new(4),
    );
    let result = pipeline.generate(&[5], &params).unwrap();
    assert_eq!(result.generation_ids[0], vec![6, 7, 8, 9]);
    assert_eq!(result.status, GenerationStatus::Finished);
}

#[test]
fn sampling_configs_are_rejected() {
    let mut pipeline = SpeculativeDecodingPipeline::new(
        Box::new(StepModel::new(VOCAB as usize)),
        Box::new(StepModel::new(VOCAB as usize)),
        spec_config(),
        SpeculativeConfig::default(),
    );
    let params = GenerationConfig {
        do_sample: true,
        max_new_tokens: Some(8),
        ..config::multinomial()
    };
    assert!(pipeline.generate(&[1, 2, 3], &params).is_err());
}

/// Both pipelines release every block once generation completes.
#[test]
fn speculative_run_leaves_no_blocks_behind() {
    let mut pipeline = SpeculativeDecodingPipeline::new(
        Box::new(StepModel::new(VOCAB as usize)),
        Box::new(StepModel::new(VOCAB as usize)),
        spec_config(),
        SpeculativeConfig::new(2),
    );
    pipeline.generate(&[30, 31, 32], &greedy_params(9)).unwrap();
    assert_eq!(pipeline.main_pipeline().scheduler().num_free_blocks(), 32);
    assert_eq!(pipeline.draft_pipeline().scheduler().num_free_blocks(), 32);
}
