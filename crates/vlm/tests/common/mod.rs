#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use std::{cell::RefCell, rc::Rc};
use vlm::{
    qwen2_vl::{
        processor::{ChatTemplate, ImageProcessor, PaddingSide},
        Qwen2VL, Qwen2VLBase, Qwen2VLProcessor,
    },
    tokenizers::{
        models::wordlevel::WordLevel, pre_tokenizers::whitespace::Whitespace, AddedToken,
        Tokenizer,
    },
    Accelerator, BatchInputs, ConditionalGeneration, ModelBundle, ModelOutput,
};

pub const WORDS: &[&str] = &[
    "<unk>",
    "<|endoftext|>",
    "<|im_start|>",
    "<|im_end|>",
    "<|image_pad|>",
    "<|video_pad|>",
    "<|vision_start|>",
    "<|vision_end|>",
    "system",
    "user",
    "assistant",
    "Answer",
    "briefly",
    ".",
    "What",
    "color",
    "is",
    "the",
    "car",
    "?",
    "red",
    "blue",
    "green",
    "describe",
];

pub const EOS: u32 = 1;

pub fn id(word: &str) -> u32 {
    WORDS.iter().position(|w| *w == word).expect("word in test vocab") as u32
}

pub fn tokenizer() -> Tokenizer {
    let vocab = WORDS
        .iter()
        .enumerate()
        .map(|(i, w)| (w.to_string(), i as u32))
        .collect();
    let model = WordLevel::builder()
        .vocab(vocab)
        .unk_token("<unk>".to_string())
        .build()
        .unwrap();
    let mut tokenizer = Tokenizer::new(model);
    tokenizer.with_pre_tokenizer(Some(Whitespace::default()));
    tokenizer.add_special_tokens(
        &WORDS[1..8]
            .iter()
            .map(|w| AddedToken::from(w.to_string(), true))
            .collect::<Vec<_>>(),
    );
    tokenizer
}

pub fn processor() -> Qwen2VLProcessor {
    Qwen2VLProcessor::new(
        tokenizer(),
        ImageProcessor::default(),
        ChatTemplate::default(),
        "<|endoftext|>",
        PaddingSide::Left,
    )
    .unwrap()
}

pub type Events = Rc<RefCell<Vec<String>>>;

/// Appends `answers[row % answers.len()]` to every input row.
pub struct FakeModel {
    pub answers: Vec<Vec<u32>>,
    pub fail_with: Option<String>,
    pub events: Events,
    pub batches: Vec<BatchInputs>,
}

impl FakeModel {
    pub fn new(answers: Vec<Vec<u32>>, events: Events) -> Self {
        Self {
            answers,
            fail_with: None,
            events,
            batches: vec![],
        }
    }
}

impl ConditionalGeneration for FakeModel {
    fn eval(&mut self) {
        self.events.borrow_mut().push("eval".to_string());
    }

    fn forward(&mut self, inputs: &BatchInputs) -> anyhow::Result<ModelOutput> {
        self.events.borrow_mut().push("forward".to_string());
        if let Some(message) = &self.fail_with {
            anyhow::bail!("{}", message);
        }
        self.batches.push(inputs.clone());
        let (batch, seq) = inputs.input_ids.dims2()?;
        Ok(ModelOutput {
            logits: Some(Tensor::zeros((batch, seq, WORDS.len()), DType::F32, &Device::Cpu)?),
            last_hidden_state: Tensor::zeros((batch, seq, 8), DType::F32, &Device::Cpu)?,
        })
    }

    fn generate(
        &mut self,
        inputs: &BatchInputs,
        max_new_tokens: usize,
    ) -> anyhow::Result<Vec<Vec<u32>>> {
        self.events
            .borrow_mut()
            .push(format!("generate:{}", max_new_tokens));
        if let Some(message) = &self.fail_with {
            anyhow::bail!("{}", message);
        }
        self.batches.push(inputs.clone());
        Ok(inputs
            .input_rows()?
            .into_iter()
            .enumerate()
            .map(|(row, mut ids)| {
                let answer = &self.answers[row % self.answers.len()];
                ids.extend(answer.iter().take(max_new_tokens));
                ids
            })
            .collect())
    }
}

pub struct FakeAccelerator {
    pub events: Events,
}

impl Accelerator for FakeAccelerator {
    fn empty_cache(&self) {
        self.events.borrow_mut().push("empty_cache".to_string());
    }

    fn move_batch(&self, inputs: BatchInputs) -> anyhow::Result<BatchInputs> {
        self.events.borrow_mut().push("move_batch".to_string());
        Ok(inputs)
    }
}

pub type FakeAdapter = Qwen2VL<FakeModel, Qwen2VLProcessor, FakeAccelerator>;

pub fn adapter(answers: Vec<Vec<u32>>) -> (FakeAdapter, Events) {
    let events = Events::default();
    let bundle = ModelBundle {
        model: FakeModel::new(answers, events.clone()),
        tokenizer: None,
        processor: processor(),
    };
    let accelerator = FakeAccelerator {
        events: events.clone(),
    };
    (Qwen2VL::from_bundle(bundle, accelerator), events)
}

pub type FakeBase = Qwen2VLBase<FakeModel, Qwen2VLProcessor, FakeAccelerator>;

pub fn base_adapter(answers: Vec<Vec<u32>>) -> (FakeBase, Events) {
    let events = Events::default();
    let bundle = ModelBundle {
        model: FakeModel::new(answers, events.clone()),
        tokenizer: None,
        processor: processor(),
    };
    let accelerator = FakeAccelerator {
        events: events.clone(),
    };
    (Qwen2VLBase::from_bundle(bundle, accelerator), events)
}
