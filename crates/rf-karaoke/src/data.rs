//! Training windows cut from songs

use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{SeparationError, SeparationResult};

/// Aligned (mixed, target) excerpt of one song
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongWindow {
    /// Song identifier
    pub name: String,
    /// First sample of the excerpt within the song
    pub start_offset: usize,
    /// Samples in the excerpt
    pub length: usize,
    /// Full mix
    pub mixed: Vec<f32>,
    /// Separation target (accompaniment)
    pub target: Vec<f32>,
}

impl SongWindow {
    pub fn new(
        name: impl Into<String>,
        start_offset: usize,
        mixed: Vec<f32>,
        target: Vec<f32>,
    ) -> SeparationResult<Self> {
        if mixed.len() != target.len() {
            return Err(SeparationError::shape(
                format!("target of {} samples", mixed.len()),
                format!("{} samples", target.len()),
            ));
        }
        Ok(Self {
            name: name.into(),
            start_offset,
            length: mixed.len(),
            mixed,
            target,
        })
    }

    /// Cut a song into back-to-back windows of `length` samples.
    /// A trailing remainder shorter than `length` is dropped.
    pub fn split_song(
        name: &str,
        mixed: &[f32],
        target: &[f32],
        length: usize,
    ) -> SeparationResult<Vec<Self>> {
        if mixed.len() != target.len() {
            return Err(SeparationError::shape(
                format!("target of {} samples", mixed.len()),
                format!("{} samples", target.len()),
            ));
        }
        if length == 0 {
            return Err(SeparationError::InvalidConfig(
                "window length must be positive".into(),
            ));
        }

        mixed
            .chunks_exact(length)
            .zip(target.chunks_exact(length))
            .enumerate()
            .map(|(i, (m, t))| Self::new(name, i * length, m.to_vec(), t.to_vec()))
            .collect()
    }
}

/// Stack windows into `(batch, length)` mixed and target arrays
pub fn stack_windows(windows: &[SongWindow]) -> SeparationResult<(Array2<f32>, Array2<f32>)> {
    let Some(first) = windows.first() else {
        return Err(SeparationError::shape("at least one window", "empty batch"));
    };
    let length = first.mixed.len();

    let mut mixed = Array2::zeros((windows.len(), length));
    let mut target = Array2::zeros((windows.len(), length));
    for (row, window) in windows.iter().enumerate() {
        if window.mixed.len() != length || window.target.len() != length {
            return Err(SeparationError::shape(
                format!("{length} samples per window"),
                format!(
                    "{} has {} mixed / {} target samples",
                    window.name,
                    window.mixed.len(),
                    window.target.len()
                ),
            ));
        }
        mixed.row_mut(row).assign(&ArrayView1::from(&window.mixed[..]));
        target.row_mut(row).assign(&ArrayView1::from(&window.target[..]));
    }

    Ok((mixed, target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_song_drops_remainder() {
        let mixed: Vec<f32> = (0..25).map(|i| i as f32).collect();
        let target = vec![0.0; 25];
        let windows = SongWindow::split_song("song", &mixed, &target, 8).unwrap();

        assert_eq!(windows.len(), 3);
        assert_eq!(windows[2].start_offset, 16);
        assert_eq!(windows[2].mixed[0], 16.0);
        assert!(windows.iter().all(|w| w.length == 8));
    }

    #[test]
    fn test_stack_windows() {
        let a = SongWindow::new("a", 0, vec![1.0; 4], vec![2.0; 4]).unwrap();
        let b = SongWindow::new("b", 4, vec![3.0; 4], vec![4.0; 4]).unwrap();
        let (mixed, target) = stack_windows(&[a.clone(), b]).unwrap();

        assert_eq!(mixed.dim(), (2, 4));
        assert_eq!(mixed[[1, 3]], 3.0);
        assert_eq!(target[[0, 0]], 2.0);

        let short = SongWindow::new("c", 0, vec![0.0; 3], vec![0.0; 3]).unwrap();
        assert!(stack_windows(&[a, short]).is_err());
        assert!(stack_windows(&[]).is_err());
    }

    #[test]
    fn test_rejects_unaligned_pair() {
        assert!(matches!(
            SongWindow::new("x", 0, vec![0.0; 4], vec![0.0; 5]),
            Err(SeparationError::ShapeMismatch { .. })
        ));
    }
}
