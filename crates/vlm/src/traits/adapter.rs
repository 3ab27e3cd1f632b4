use super::{ModelOutput, Processor};
use crate::{ImageSource, Query};
use image::DynamicImage;

/// Model-agnostic surface over one pretrained vision-language model.
///
/// Call sites written against this trait keep working when the concrete
/// model family behind it changes.
pub trait ModelAdapter {
    type Processor: Processor;

    /// Single forward pass over a batch, no generation.
    fn process(&mut self, texts: &[String], images: &[DynamicImage])
        -> anyhow::Result<ModelOutput>;

    /// Batched generation. Returns one answer per text, in input order,
    /// with the prompt and special tokens removed.
    fn generate(&mut self, texts: &[String], images: &[DynamicImage])
        -> anyhow::Result<Vec<String>>;

    fn get_processor(&self) -> &Self::Processor;
}

/// Adapters that answer natural-language questions about images.
pub trait ImageQueryModel: ModelAdapter {
    /// Stable identifier of the model family.
    fn get_model_name(&self) -> &str;

    /// `images[i][0]` is the image asked about by `queries[i]`.
    fn process_image_queries(
        &mut self,
        images: &[Vec<ImageSource>],
        queries: &[Query],
    ) -> anyhow::Result<Vec<String>>;
}
