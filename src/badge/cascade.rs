//! Haar cascade face detector reading OpenCV's XML models
//!
//! Loads the boosted HAAR cascades OpenCV ships under `data/haarcascades`
//! (`haarcascade_frontalface_default.xml` and friends, in the format written
//! by OpenCV 3 and later) and scans an image pyramid with them. Each window
//! is normalised by its standard deviation, every stage sums the leaves its
//! decision trees reach, and a window is a face once all stages pass.

use anyhow::{bail, Context, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::integral_image::{integral_image, integral_squared_image, sum_image_pixels};
use roxmltree::{Document, Node};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

use super::face_detection::{group_rectangles, FaceBox, FaceLocator};

const GROUPING_EPS: f64 = 0.2;

/// Windows whose normalisation factor is this small relative to their area
/// (standard deviation at or below 10) are never faces
const MIN_VARIANCE_RATIO: f64 = 0.1;

type IntegralTable = ImageBuffer<Luma<u64>, Vec<u64>>;

#[derive(Debug, Clone, PartialEq)]
pub struct HaarRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HaarFeature {
    pub rects: Vec<HaarRect>,
    /// Rectangles rotated by 45 degrees
    pub tilted: bool,
}

/// Split node of a weak classifier tree
///
/// `left` and `right` are node indices when positive, otherwise the negated
/// index of a leaf value.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub left: i32,
    pub right: i32,
    pub feature: usize,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeakTree {
    pub nodes: Vec<TreeNode>,
    pub leaves: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub threshold: f64,
    pub trees: Vec<WeakTree>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cascade {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<Stage>,
    pub features: Vec<HaarFeature>,
}

impl Cascade {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cascade file: {}", path.display()))?;
        Self::from_xml(&contents)
            .with_context(|| format!("Failed to parse cascade file: {}", path.display()))
    }

    /// Parse an `<opencv_storage><cascade>` document
    pub fn from_xml(text: &str) -> Result<Self> {
        let doc = Document::parse(text).context("Cascade is not well-formed XML")?;
        let root = doc.root_element();

        let Some(node) = child(root, "cascade") else {
            if root
                .children()
                .any(|n| n.attribute("type_id") == Some("opencv-haar-classifier"))
            {
                bail!("Old-style OpenCV cascade format is not supported; use a model saved by OpenCV 3 or later");
            }
            bail!("Missing <cascade> element");
        };

        let stage_type = required_text(node, "stageType")?;
        if stage_type != "BOOST" {
            bail!("Unsupported stage type '{}', only BOOST cascades are supported", stage_type);
        }
        let feature_type = required_text(node, "featureType")?;
        if feature_type != "HAAR" {
            bail!("Unsupported feature type '{}', only HAAR cascades are supported", feature_type);
        }

        let window_width = parse_token(required_text(node, "width")?, "width")?;
        let window_height = parse_token(required_text(node, "height")?, "height")?;

        let stages = elements(required_child(node, "stages")?)
            .enumerate()
            .map(|(i, n)| parse_stage(n).with_context(|| format!("Invalid stage {}", i)))
            .collect::<Result<Vec<_>>>()?;
        let features = elements(required_child(node, "features")?)
            .enumerate()
            .map(|(i, n)| parse_feature(n).with_context(|| format!("Invalid feature {}", i)))
            .collect::<Result<Vec<_>>>()?;

        let cascade = Cascade { window_width, window_height, stages, features };
        cascade.validate()?;
        Ok(cascade)
    }

    pub fn validate(&self) -> Result<()> {
        let (ww, wh) = (self.window_width, self.window_height);
        if ww < 3 || wh < 3 {
            bail!("Cascade window {}x{} is too small", ww, wh);
        }
        if self.stages.is_empty() {
            bail!("Cascade has no stages");
        }

        for (i, feature) in self.features.iter().enumerate() {
            if feature.rects.is_empty() {
                bail!("Feature {} has no rectangles", i);
            }
            for r in &feature.rects {
                let inside = if feature.tilted {
                    r.x >= r.height && r.x + r.width <= ww && r.y + r.width + r.height <= wh
                } else {
                    r.x + r.width <= ww && r.y + r.height <= wh
                };
                if r.width == 0 || r.height == 0 || !inside {
                    bail!("Feature {} has a rectangle outside the {}x{} window", i, ww, wh);
                }
            }
        }

        for (s, stage) in self.stages.iter().enumerate() {
            if stage.trees.is_empty() {
                bail!("Stage {} has no weak classifiers", s);
            }
            for tree in &stage.trees {
                if tree.nodes.is_empty() {
                    bail!("Stage {} has a weak classifier without nodes", s);
                }
                for (n, node) in tree.nodes.iter().enumerate() {
                    if node.feature >= self.features.len() {
                        bail!("Stage {} references missing feature {}", s, node.feature);
                    }
                    for next in [node.left, node.right] {
                        let valid = if next > 0 {
                            // Children come after their parent, so evaluation always ends
                            (next as usize) > n && (next as usize) < tree.nodes.len()
                        } else {
                            (next.unsigned_abs() as usize) < tree.leaves.len()
                        };
                        if !valid {
                            bail!("Stage {} has a tree with an invalid branch {}", s, next);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn has_tilted_features(&self) -> bool {
        self.features.iter().any(|f| f.tilted)
    }
}

fn elements<'a, 'i>(node: Node<'a, 'i>) -> impl Iterator<Item = Node<'a, 'i>> {
    node.children().filter(|n| n.is_element())
}

fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Option<Node<'a, 'i>> {
    node.children().find(|n| n.has_tag_name(name))
}

fn required_child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Result<Node<'a, 'i>> {
    child(node, name).with_context(|| format!("Missing <{}> element", name))
}

fn required_text<'a>(node: Node<'a, '_>, name: &str) -> Result<&'a str> {
    Ok(required_child(node, name)?.text().unwrap_or("").trim())
}

fn parse_token<T: std::str::FromStr>(token: &str, what: &str) -> Result<T> {
    token
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid {} value '{}'", what, token))
}

fn tokens<'a>(node: Node<'a, '_>) -> impl Iterator<Item = &'a str> {
    node.text().unwrap_or("").split_whitespace()
}

fn parse_stage(node: Node) -> Result<Stage> {
    let threshold = parse_token(required_text(node, "stageThreshold")?, "stageThreshold")?;
    let trees = elements(required_child(node, "weakClassifiers")?)
        .map(parse_tree)
        .collect::<Result<Vec<_>>>()?;
    Ok(Stage { threshold, trees })
}

fn parse_tree(node: Node) -> Result<WeakTree> {
    let raw: Vec<&str> = tokens(required_child(node, "internalNodes")?).collect();
    if raw.is_empty() || raw.len() % 4 != 0 {
        bail!("internalNodes must hold groups of four values, found {}", raw.len());
    }
    let nodes = raw
        .chunks(4)
        .map(|n| -> Result<TreeNode> {
            Ok(TreeNode {
                left: parse_token(n[0], "left node")?,
                right: parse_token(n[1], "right node")?,
                feature: parse_token(n[2], "feature index")?,
                threshold: parse_token(n[3], "node threshold")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let leaves = tokens(required_child(node, "leafValues")?)
        .map(|t| parse_token(t, "leaf value"))
        .collect::<Result<Vec<_>>>()?;
    Ok(WeakTree { nodes, leaves })
}

fn parse_feature(node: Node) -> Result<HaarFeature> {
    let rects = elements(required_child(node, "rects")?)
        .map(|r| -> Result<HaarRect> {
            let values: Vec<&str> = tokens(r).collect();
            if values.len() != 5 {
                bail!("A rectangle needs 'x y width height weight', found {} values", values.len());
            }
            Ok(HaarRect {
                x: parse_token(values[0], "x")?,
                y: parse_token(values[1], "y")?,
                width: parse_token(values[2], "width")?,
                height: parse_token(values[3], "height")?,
                weight: parse_token(values[4], "weight")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let tilted = match child(node, "tilted") {
        Some(t) => parse_token::<i32>(t.text().unwrap_or("0"), "tilted")? != 0,
        None => false,
    };
    Ok(HaarFeature { rects, tilted })
}

/// Multi-scale search parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectorParams {
    pub scale_factor: f64,
    pub min_neighbors: usize,
    pub min_size: u32,
    pub max_size: Option<u32>,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 3,
            min_size: 30,
            max_size: Some(200),
        }
    }
}

/// Rotated summed-area table for 45 degree features
///
/// `T(X, Y)` holds the sum of the pixels above row `Y` that lie inside the
/// upward triangle whose apex is pixel `(X - 1, Y - 1)`. The table is padded
/// horizontally so the recurrence never reads outside it.
struct TiltedIntegral {
    pad: usize,
    stride: usize,
    table: Vec<i64>,
}

impl TiltedIntegral {
    fn new(img: &GrayImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let pad = h + 2;
        let stride = w + 1 + 2 * pad;
        let mut table = vec![0i64; stride * (h + 1)];
        let pixel = |x: i64, y: i64| -> i64 {
            if x < 0 || y < 0 || x >= w as i64 || y >= h as i64 {
                0
            } else {
                img.get_pixel(x as u32, y as u32)[0] as i64
            }
        };

        for y in 1..=h {
            for c in 0..stride {
                let up = |dc: i64, dy: usize| -> i64 {
                    let cc = c as i64 + dc;
                    if y < dy || cc < 0 || cc >= stride as i64 {
                        0
                    } else {
                        table[(y - dy) * stride + cc as usize]
                    }
                };
                let (px, py) = (c as i64 - pad as i64, y as i64);
                let value = up(-1, 1) + up(1, 1) - up(0, 2)
                    + pixel(px - 1, py - 1)
                    + pixel(px - 1, py - 2);
                table[y * stride + c] = value;
            }
        }

        Self { pad, stride, table }
    }

    fn at(&self, x: i64, y: u32) -> i64 {
        self.table[y as usize * self.stride + (x + self.pad as i64) as usize]
    }

    /// Sum of a 45 degree rectangle anchored at `(x, y)`
    fn rect(&self, x: u32, y: u32, w: u32, h: u32) -> i64 {
        let (x, w, h) = (x as i64, w as i64, h as i64);
        self.at(x, y) - self.at(x - h, y + h as u32) - self.at(x + w, y + w as u32)
            + self.at(x + w - h, y + (w + h) as u32)
    }
}

/// Integral tables of one pyramid level
struct ScaledImage {
    sum: IntegralTable,
    sq_sum: IntegralTable,
    tilted: Option<TiltedIntegral>,
}

impl ScaledImage {
    fn new(img: &GrayImage, with_tilted: bool) -> Self {
        Self {
            sum: integral_image::<_, u64>(img),
            sq_sum: integral_squared_image::<_, u64>(img),
            tilted: with_tilted.then(|| TiltedIntegral::new(img)),
        }
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        sum_image_pixels(&self.sum, x, y, x + w - 1, y + h - 1)[0]
    }

    fn sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        sum_image_pixels(&self.sq_sum, x, y, x + w - 1, y + h - 1)[0]
    }
}

pub struct CascadeDetector {
    cascade: Cascade,
    params: DetectorParams,
}

impl CascadeDetector {
    pub fn new(cascade: Cascade, params: DetectorParams) -> Self {
        Self { cascade, params }
    }

    pub fn from_file(path: &Path, params: DetectorParams) -> Result<Self> {
        let cascade = Cascade::from_file(path)?;
        debug!(
            path = %path.display(),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded face cascade"
        );
        Ok(Self::new(cascade, params))
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// Every accepted window across all scales, before grouping
    pub fn raw_detections(&self, image: &GrayImage) -> Vec<FaceBox> {
        let (iw, ih) = image.dimensions();
        let (ww, wh) = (self.cascade.window_width, self.cascade.window_height);
        let mut found = Vec::new();

        if !(self.params.scale_factor > 1.0) {
            warn!(scale_factor = self.params.scale_factor, "scale factor must exceed 1.0");
            return found;
        }

        let with_tilted = self.cascade.has_tilted_features();
        let mut factor = 1.0f64;
        loop {
            let win_w = (ww as f64 * factor).round() as u32;
            let win_h = (wh as f64 * factor).round() as u32;
            if win_w > iw || win_h > ih {
                break;
            }
            if let Some(max) = self.params.max_size {
                if win_w > max || win_h > max {
                    break;
                }
            }
            if win_w < self.params.min_size || win_h < self.params.min_size {
                factor *= self.params.scale_factor;
                continue;
            }

            let sw = (iw as f64 / factor).round() as u32;
            let sh = (ih as f64 / factor).round() as u32;
            if sw < ww || sh < wh {
                break;
            }
            let level = if sw == iw && sh == ih {
                ScaledImage::new(image, with_tilted)
            } else {
                ScaledImage::new(&imageops::resize(image, sw, sh, FilterType::Triangle), with_tilted)
            };

            let step = if factor > 2.0 { 1 } else { 2 };
            for y in (0..=sh - wh).step_by(step) {
                for x in (0..=sw - ww).step_by(step) {
                    if self.accepts(&level, x, y) {
                        let fx = ((x as f64 * factor).round() as u32).min(iw - win_w);
                        let fy = ((y as f64 * factor).round() as u32).min(ih - win_h);
                        found.push(FaceBox::new(fx, fy, win_w, win_h));
                    }
                }
            }

            factor *= self.params.scale_factor;
        }

        found
    }

    fn accepts(&self, level: &ScaledImage, x: u32, y: u32) -> bool {
        // Variance is measured one pixel inside the window
        let (nw, nh) = (self.cascade.window_width - 2, self.cascade.window_height - 2);
        let area = (nw * nh) as f64;
        let sum = level.sum(x + 1, y + 1, nw, nh) as f64;
        let sq_sum = level.sq_sum(x + 1, y + 1, nw, nh) as f64;
        let norm = area * sq_sum - sum * sum;
        if norm <= 0.0 {
            return false;
        }
        let norm = norm.sqrt();
        if area / norm >= MIN_VARIANCE_RATIO {
            return false;
        }

        self.cascade.stages.iter().all(|stage| {
            let votes: f64 = stage
                .trees
                .iter()
                .map(|tree| self.evaluate_tree(tree, level, x, y, norm))
                .sum();
            votes >= stage.threshold
        })
    }

    fn evaluate_tree(&self, tree: &WeakTree, level: &ScaledImage, x: u32, y: u32, norm: f64) -> f64 {
        let mut idx = 0usize;
        loop {
            let node = &tree.nodes[idx];
            let value = self.feature_value(&self.cascade.features[node.feature], level, x, y) / norm;
            let next = if value < node.threshold { node.left } else { node.right };
            if next <= 0 {
                return tree.leaves[next.unsigned_abs() as usize];
            }
            idx = next as usize;
        }
    }

    fn feature_value(&self, feature: &HaarFeature, level: &ScaledImage, x: u32, y: u32) -> f64 {
        feature
            .rects
            .iter()
            .map(|r| {
                let sum = match (&level.tilted, feature.tilted) {
                    (Some(tilted), true) => tilted.rect(x + r.x, y + r.y, r.width, r.height) as f64,
                    _ => level.sum(x + r.x, y + r.y, r.width, r.height) as f64,
                };
                r.weight * sum
            })
            .sum()
    }
}

impl FaceLocator for CascadeDetector {
    fn locate(&self, image: &GrayImage) -> Vec<FaceBox> {
        let raw = self.raw_detections(image);
        let grouped = group_rectangles(&raw, self.params.min_neighbors, GROUPING_EPS);
        debug!(raw = raw.len(), faces = grouped.len(), "cascade detection finished");
        grouped
    }
}
