use std::collections::HashMap;
use std::path::Path;

use hermes_train::checkpointing::{checkpoint_dir, load_checkpoint_for_training};
use hermes_train::optimization::{AdamW, LrScheduler};
use hermes_train::{Mode, ModelWrapper, ProcessGroupManager, TrainingArgs};
use serde_json::json;
use tokenizers::models::wordlevel::WordLevel;
use tokenizers::pre_tokenizers::whitespace::Whitespace;
use tokenizers::{AddedToken, Tokenizer};

const NUM_WORDS: usize = 20;

fn write_tokenizer(path: &Path) {
    let mut vocab: HashMap<String, u32> = HashMap::new();
    vocab.insert("<unk>".to_string(), 0);
    vocab.insert("</s>".to_string(), 1);
    for i in 0..NUM_WORDS {
        vocab.insert(format!("w{i}"), i as u32 + 2);
    }
    let model = WordLevel::builder()
        .vocab(vocab.into_iter().collect())
        .unk_token("<unk>".to_string())
        .build()
        .unwrap();
    let mut tokenizer = Tokenizer::new(model);
    tokenizer.with_pre_tokenizer(Some(Whitespace {}));
    tokenizer.add_special_tokens(&[AddedToken::from("</s>", true)]);
    tokenizer.save(path, false).unwrap();
}

fn write_corpus(path: &Path, num_docs: usize, offset: usize) {
    let lines: Vec<String> = (0..num_docs)
        .map(|doc| {
            let words: Vec<String> = (0..7)
                .map(|i| format!("w{}", (doc * 3 + i + offset) % NUM_WORDS))
                .collect();
            json!({ "text": words.join(" ") }).to_string()
        })
        .collect();
    std::fs::write(path, lines.join("\n")).unwrap();
}

fn training_args(dir: &Path, save_dir: &str, num_training_steps: usize) -> serde_json::Value {
    json!({
        "model_args": {
            "pretrained_config": {
                "model_type": "gpt",
                "vocab_size": NUM_WORDS + 2,
                "max_seq_len": 16,
                "hidden_size": 16,
                "num_layers": 1,
                "num_heads": 2,
                "num_kv_heads": 2,
                "intermediate_size": 32,
                "activation_function": "gelu",
                "dropout": 0.0,
                "layer_norm_eps": 1e-5,
                "use_bias": true,
                "rope_theta": 10000.0
            }
        },
        "tokenizer_args": { "tokenizer_name": dir.join("tokenizer.json") },
        "training_parameters": {
            "num_training_steps": num_training_steps,
            "micro_batch_size": 2,
            "gradient_accumulation_steps": 2,
            "gradient_clipping": 1.0,
            "eval_interval": 2
        },
        "save_args": { "save_path": dir.join(save_dir), "save_interval": 2 },
        "logging_args": {
            "log_interval": 2,
            "experiments_tracker_name": "jsonl",
            "tracker_path": dir.join("metrics.jsonl")
        },
        "datasets": {
            "train_files": [dir.join("train.jsonl")],
            "val": [{ "name": "held_out", "files": [dir.join("val.jsonl")] }],
            "test": [{ "files": [dir.join("val.jsonl")] }],
            "sequence_length": 8,
            "eval_steps": 1
        },
        "optimizer_args": {
            "learning_rate": 1e-3,
            "weight_decay": 0.01,
            "beta1": 0.9,
            "beta2": 0.95,
            "eps": 1e-8
        },
        "lr_scheduler_args": { "num_warmup_steps": 1, "lr_decay_style": "cosine", "lr_decay_factor": 0.1 }
    })
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn test_pretrain_checkpoint_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    write_tokenizer(&dir.path().join("tokenizer.json"));
    write_corpus(&dir.path().join("train.jsonl"), 24, 0);
    write_corpus(&dir.path().join("val.jsonl"), 6, 5);

    let args: TrainingArgs = serde_json::from_value(training_args(dir.path(), "ckpt", 4)).unwrap();
    hermes_train::pretrain::run(&args, Mode::Training, ProcessGroupManager::single_process()).unwrap();

    let save_path = dir.path().join("ckpt");
    assert_eq!(
        read_json(&save_path.join("latest_checkpointed_iteration.json"))["latest_checkpointed_iteration"],
        4
    );
    for iteration in [2, 4] {
        let checkpoint = checkpoint_dir(&save_path, iteration);
        for file in ["model.safetensors", "optimizer.safetensors", "lr_scheduler.json", "args.json"] {
            assert!(checkpoint.join(file).exists(), "missing {file} at step {iteration}");
        }
    }
    // 4 steps x 2 micro-batches x 2 samples
    assert_eq!(
        read_json(&checkpoint_dir(&save_path, 4).join("metadata.json"))["consumed_samples"],
        16
    );

    let entries: Vec<serde_json::Value> = std::fs::read_to_string(dir.path().join("metrics.jsonl"))
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let train_steps: Vec<u64> = entries
        .iter()
        .filter(|e| e["context"] == "train")
        .map(|e| e["step"].as_u64().unwrap())
        .collect();
    assert_eq!(train_steps, vec![2, 4]);
    let train = entries.iter().find(|e| e["context"] == "train").unwrap();
    assert!(train["metrics"]["loss"].as_f64().unwrap().is_finite());
    assert!(train["metrics"]["grad_norm"].as_f64().unwrap() >= 0.0);
    assert!(train["metrics"]["learning_rate"].as_f64().unwrap() > 0.0);
    assert!(
        entries
            .iter()
            .any(|e| e["context"] == "val" && e["metrics"]["held_out-loss"].is_number())
    );
    let run_id = entries[0]["run_id"].as_str().unwrap().to_string();

    // restore step 2 without the dataloader position
    let mut resume = training_args(dir.path(), "ckpt", 4);
    resume["load_args"] = json!({
        "load_path": save_path,
        "iteration": 2,
        "load_dataloader_state": false
    });
    let resume: TrainingArgs = serde_json::from_value(resume).unwrap();
    let model = ModelWrapper::new(&resume, Mode::Training, 0).unwrap();
    let mut optimizer =
        AdamW::from_var_map(model.var_map(), AdamW::params_from_args(&resume.optimizer_args)).unwrap();
    let mut lr_scheduler = LrScheduler::new(
        resume.optimizer_args.learning_rate,
        &resume.lr_scheduler_args,
        resume.training_parameters.num_training_steps,
    )
    .unwrap();
    let (iteration, metadata, tracker_state) =
        load_checkpoint_for_training(&resume, &model, &mut optimizer, &mut lr_scheduler).unwrap();
    assert_eq!(iteration, 2);
    assert_eq!(metadata.unwrap().consumed_samples, 0);
    assert_eq!(tracker_state.unwrap().run_id, run_id);
    assert_eq!(optimizer.step_count(), 2);
    assert_eq!(lr_scheduler.current_step(), 2);

    // continue from the latest checkpoint into a fresh directory
    let mut resume = training_args(dir.path(), "ckpt_resumed", 5);
    resume["load_args"] = json!({ "load_path": save_path });
    let resume: TrainingArgs = serde_json::from_value(resume).unwrap();
    hermes_train::pretrain::run(&resume, Mode::Training, ProcessGroupManager::single_process()).unwrap();

    let resumed_path = dir.path().join("ckpt_resumed");
    assert_eq!(
        read_json(&resumed_path.join("latest_checkpointed_iteration.json"))["latest_checkpointed_iteration"],
        5
    );
    assert!(!checkpoint_dir(&resumed_path, 4).exists());
    assert_eq!(
        read_json(&checkpoint_dir(&resumed_path, 5).join("metadata.json"))["consumed_samples"],
        20
    );
}

#[test]
fn test_pretrain_rejects_distillation() {
    let dir = tempfile::tempdir().unwrap();
    let args: TrainingArgs = serde_json::from_value(training_args(dir.path(), "ckpt", 1)).unwrap();
    let err = hermes_train::pretrain::run(&args, Mode::Distillation, ProcessGroupManager::single_process())
        .unwrap_err();
    assert!(matches!(err, hermes_train::Error::UnsupportedOperation(_)));
}
