use crate::{
    error::{CrnnError, Result},
    tensor::{Tensor, TensorDesc},
};

/// One training batch: images plus the three CTC label inputs.
///
/// Images are [B, H, W, 1] grayscale in [0, 1], which with a single channel
/// is the same buffer as the NCHW tensor stored here.
#[derive(Clone, Debug)]
pub struct Batch {
    pub true_labels: Vec<i64>,       // [B, max_label_length]
    pub images: Tensor,              // [B, 1, H, W]
    pub predicted_lengths: Vec<i64>, // [B, 1]
    pub true_lengths: Vec<i64>,      // [B, 1]
    pub max_label_length: usize,
    pub batch_number: usize,
}

impl Batch {
    pub fn new(
        true_labels: Vec<i64>,
        images: Tensor,
        predicted_lengths: Vec<i64>,
        true_lengths: Vec<i64>,
        max_label_length: usize,
        batch_number: usize,
    ) -> Result<Self> {
        let size = match images.desc {
            TensorDesc::Tensor4D { batch, channels: 1, .. } => batch,
            ref other => {
                return Err(CrnnError::ShapeMismatch {
                    context: "batch images".into(),
                    expected: "[B, H, W, 1]".into(),
                    actual: other.to_string(),
                })
            }
        };
        let check = |name: &str, expected: usize, actual: usize| -> Result<()> {
            if expected != actual {
                return Err(CrnnError::ShapeMismatch {
                    context: format!("batch {}", name),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
            Ok(())
        };
        check("true_labels", size * max_label_length, true_labels.len())?;
        check("predicted_lengths", size, predicted_lengths.len())?;
        check("true_lengths", size, true_lengths.len())?;

        for (sample, (&true_length, &predicted_length)) in true_lengths.iter().zip(&predicted_lengths).enumerate() {
            if true_length < 0 || true_length as usize > max_label_length {
                return Err(CrnnError::LabelTooLong {
                    label: format!("sample {}", sample),
                    length: true_length.max(0) as usize,
                    max: max_label_length,
                });
            }
            if predicted_length < 1 {
                return Err(CrnnError::ShapeMismatch {
                    context: format!("batch predicted_lengths, sample {}", sample),
                    expected: ">= 1".into(),
                    actual: predicted_length.to_string(),
                });
            }
            if true_length > predicted_length {
                return Err(CrnnError::LengthInvariant {
                    sample,
                    true_length,
                    predicted_length,
                });
            }
        }

        Ok(Self {
            true_labels,
            images,
            predicted_lengths,
            true_lengths,
            max_label_length,
            batch_number,
        })
    }

    pub fn len(&self) -> usize {
        self.true_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.true_lengths.is_empty()
    }

    /// Image shape as [B, H, W, 1]; the stored buffer has the same layout.
    pub fn image_dims(&self) -> [usize; 4] {
        match self.images.desc {
            TensorDesc::Tensor4D { batch, height, width, .. } => [batch, height, width, 1],
            _ => [self.len(), 0, 0, 1],
        }
    }

    /// Padded label row of one sample.
    pub fn label(&self, sample: usize) -> &[i64] {
        &self.true_labels[sample * self.max_label_length..(sample + 1) * self.max_label_length]
    }

    /// Pixels of one sample, row-major H×W.
    pub fn image(&self, sample: usize) -> &[f32] {
        let per_image = self.images.len() / self.len().max(1);
        &self.images.data[sample * per_image..(sample + 1) * per_image]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn images(batch: usize) -> Tensor {
        Tensor::zeros(TensorDesc::new_tensor4d(batch, 1, 2, 4))
    }

    #[test]
    fn accepts_consistent_inputs() {
        let batch = Batch::new(vec![1, 2, 0, 3, 0, 0], images(2), vec![1, 1], vec![2, 1], 3, 0);
        // true length 2 > predicted 1
        assert!(matches!(batch, Err(CrnnError::LengthInvariant { sample: 0, .. })));

        let batch = Batch::new(vec![1, 2, 0, 3, 0, 0], images(2), vec![4, 4], vec![2, 1], 3, 7).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.label(1), &[3, 0, 0]);
        assert_eq!(batch.image(1).len(), 8);
        assert_eq!(batch.image_dims(), [2, 2, 4, 1]);
    }

    #[test]
    fn rejects_mismatched_leading_dimension() {
        assert!(Batch::new(vec![0; 6], images(2), vec![4], vec![1, 1], 3, 0).is_err());
        assert!(Batch::new(vec![0; 5], images(2), vec![4, 4], vec![1, 1], 3, 0).is_err());
        let rgb = Tensor::zeros(TensorDesc::new_tensor4d(2, 3, 2, 4));
        assert!(Batch::new(vec![0; 6], rgb, vec![4, 4], vec![1, 1], 3, 0).is_err());
    }

    #[test]
    fn rejects_lengths_outside_the_label_width() {
        let too_long = Batch::new(vec![1, 1, 1], images(1), vec![8], vec![5], 3, 0);
        assert!(matches!(too_long, Err(CrnnError::LabelTooLong { length: 5, max: 3, .. })));

        let negative = Batch::new(vec![1, 1, 1], images(1), vec![8], vec![-2], 3, 0);
        assert!(matches!(negative, Err(CrnnError::LabelTooLong { length: 0, max: 3, .. })));

        let no_frames = Batch::new(vec![0, 0, 0], images(1), vec![0], vec![0], 3, 0);
        assert!(matches!(no_frames, Err(CrnnError::ShapeMismatch { .. })));
    }
}
