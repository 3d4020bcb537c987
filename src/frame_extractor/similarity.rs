//! 区域感知相似度 - 3×3 网格分区采样，双判据判定近重复
//!
//! 整体相似度超过阈值，或绝大多数分区各自超过稍低的分区阈值，即视为太相似。
//! 前者抓“只差一条字幕”的帧，后者避免被大面积静止区域（黑边）稀释。

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::core::video::Frame;

#[derive(Debug, Clone)]
pub struct SimilarityConfig {
    /// 网格边长（grid × grid 个分区）
    pub grid: u32,
    /// 总采样预算，平均分配到各分区
    pub max_samples: u32,
    pub diversity_threshold: f32,
    /// 分区阈值，略低于整体阈值
    pub region_threshold: f32,
    /// 超过分区阈值的分区数达到该值即判为太相似
    pub region_super_majority: usize,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            grid: 3,
            max_samples: 900,
            diversity_threshold: 0.8,
            region_threshold: 0.75,
            region_super_majority: 7,
        }
    }
}

impl SimilarityConfig {
    pub fn with_threshold(diversity_threshold: f32) -> Self {
        Self {
            diversity_threshold,
            region_threshold: (diversity_threshold - 0.05).max(0.0),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityReport {
    pub overall: f32,
    pub regions: Vec<f32>,
    pub too_similar: bool,
}

pub struct SimilarityEngine {
    config: SimilarityConfig,
}

impl SimilarityEngine {
    pub fn new(config: SimilarityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SimilarityConfig {
        &self.config
    }

    /// 0-1，尺寸不一致返回 0
    pub fn similarity(&self, a: &Frame, b: &Frame) -> f32 {
        self.compare(a, b).overall
    }

    pub fn compare(&self, a: &Frame, b: &Frame) -> SimilarityReport {
        let grid = self.config.grid.max(1);
        if !a.same_dimensions(b) || !a.is_well_formed() || !b.is_well_formed() {
            return SimilarityReport {
                overall: 0.0,
                regions: vec![0.0; (grid * grid) as usize],
                too_similar: false,
            };
        }

        let per_region = (self.config.max_samples / (grid * grid)).max(1);
        let side = (per_region as f64).sqrt().floor().max(1.0) as u32;

        let mut regions = Vec::with_capacity((grid * grid) as usize);
        let mut total = 0.0f64;
        let mut total_count = 0u32;

        for gy in 0..grid {
            for gx in 0..grid {
                let x0 = a.width * gx / grid;
                let x1 = a.width * (gx + 1) / grid;
                let y0 = a.height * gy / grid;
                let y1 = a.height * (gy + 1) / grid;
                if x1 <= x0 || y1 <= y0 {
                    regions.push(1.0);
                    continue;
                }

                let mut region_sum = 0.0f64;
                let mut count = 0u32;
                for sy in 0..side {
                    let y = y0 + ((2 * sy + 1) * (y1 - y0)) / (2 * side);
                    for sx in 0..side {
                        let x = x0 + ((2 * sx + 1) * (x1 - x0)) / (2 * side);
                        region_sum += pixel_similarity(a.rgb_at(x, y), b.rgb_at(x, y)) as f64;
                        count += 1;
                    }
                }

                total += region_sum;
                total_count += count;
                regions.push((region_sum / count as f64) as f32);
            }
        }

        let overall = if total_count == 0 {
            0.0
        } else {
            (total / total_count as f64) as f32
        };
        let similar_regions = regions
            .iter()
            .filter(|&&r| r > self.config.region_threshold)
            .count();
        let too_similar = overall > self.config.diversity_threshold
            || similar_regions >= self.config.region_super_majority;

        SimilarityReport {
            overall,
            regions,
            too_similar,
        }
    }

    pub fn is_too_similar(&self, a: &Frame, b: &Frame) -> bool {
        self.compare(a, b).too_similar
    }

    /// 两两比较，结果对称；在线程池里按行并行
    pub fn matrix(&self, frames: &[&Frame], pool: &ThreadPool) -> SimilarityMatrix {
        let n = frames.len();
        let rows: Vec<Vec<(f32, bool)>> = pool.install(|| {
            (0..n)
                .into_par_iter()
                .map(|i| {
                    ((i + 1)..n)
                        .map(|j| {
                            let report = self.compare(frames[i], frames[j]);
                            (report.overall, report.too_similar)
                        })
                        .collect()
                })
                .collect()
        });

        let mut matrix = SimilarityMatrix::identity(n);
        for (i, row) in rows.into_iter().enumerate() {
            for (offset, (sim, too_similar)) in row.into_iter().enumerate() {
                matrix.set(i, i + 1 + offset, sim, too_similar);
            }
        }
        matrix
    }
}

/// 单像素：1 - 平均通道绝对差
#[inline]
fn pixel_similarity(a: [u8; 3], b: [u8; 3]) -> f32 {
    let diff = a[0].abs_diff(b[0]) as u32 + a[1].abs_diff(b[1]) as u32 + a[2].abs_diff(b[2]) as u32;
    1.0 - diff as f32 / (3.0 * 255.0)
}

/// 候选帧两两相似度缓存
#[derive(Debug, Clone)]
pub struct SimilarityMatrix {
    n: usize,
    values: Vec<f32>,
    too_similar: Vec<bool>,
}

impl SimilarityMatrix {
    pub fn identity(n: usize) -> Self {
        let mut values = vec![0.0; n * n];
        let mut too_similar = vec![false; n * n];
        for i in 0..n {
            values[i * n + i] = 1.0;
            too_similar[i * n + i] = true;
        }
        Self {
            n,
            values,
            too_similar,
        }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn set(&mut self, i: usize, j: usize, similarity: f32, too_similar: bool) {
        self.values[i * self.n + j] = similarity;
        self.values[j * self.n + i] = similarity;
        self.too_similar[i * self.n + j] = too_similar;
        self.too_similar[j * self.n + i] = too_similar;
    }

    pub fn get(&self, i: usize, j: usize) -> f32 {
        self.values[i * self.n + j]
    }

    pub fn too_similar(&self, i: usize, j: usize) -> bool {
        self.too_similar[i * self.n + j]
    }

    /// 与其他所有帧的平均相似度取反：越独特越高
    pub fn uniqueness(&self, i: usize) -> f32 {
        if self.n < 2 {
            return 1.0;
        }
        let sum: f32 = (0..self.n).filter(|&j| j != i).map(|j| self.get(i, j)).sum();
        (1.0 - sum / (self.n - 1) as f32).clamp(0.0, 1.0)
    }

    /// 按新顺序重排（索引映射 new -> old）
    pub fn reorder(&self, order: &[usize]) -> SimilarityMatrix {
        let mut out = SimilarityMatrix::identity(order.len());
        for (ni, &oi) in order.iter().enumerate() {
            for (nj, &oj) in order.iter().enumerate().skip(ni + 1) {
                out.set(ni, nj, self.get(oi, oj), self.too_similar(oi, oj));
            }
        }
        out
    }
}
