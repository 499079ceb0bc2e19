use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Axis-aligned face rectangle in source image pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }

    pub fn contains_point(&self, px: u32, py: u32) -> bool {
        px >= self.x && py >= self.y && px < self.x + self.width && py < self.y + self.height
    }

    fn contains_box(&self, other: &FaceBox) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.x + other.width <= self.x + self.width
            && other.y + other.height <= self.y + self.height
    }
}

/// Finds candidate faces in a grayscale image
///
/// One pass, finite result; an empty vector means no face was found.
pub trait FaceLocator: Send + Sync {
    fn locate(&self, image: &GrayImage) -> Vec<FaceBox>;
}

/// Locator that never finds anything, so every badge uses the whole photo
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaceLocator;

impl FaceLocator for NoFaceLocator {
    fn locate(&self, _image: &GrayImage) -> Vec<FaceBox> {
        Vec::new()
    }
}

/// Pick the primary face: largest area, ties go to the box whose centre is
/// closest to the image's horizontal centre
pub fn select_primary_face(faces: &[FaceBox], image_width: u32) -> Option<FaceBox> {
    let mid = image_width as f64 / 2.0;
    faces.iter().copied().reduce(|best, candidate| {
        let best_offset = (best.center().0 - mid).abs();
        let candidate_offset = (candidate.center().0 - mid).abs();
        if candidate.area() > best.area()
            || (candidate.area() == best.area() && candidate_offset < best_offset)
        {
            candidate
        } else {
            best
        }
    })
}

/// Merge overlapping raw detections
///
/// Rectangles are clustered by similarity (`eps` relative tolerance); a
/// cluster survives when it has more than `min_neighbors` members and is
/// replaced by the average of its members. Small clusters sitting inside a
/// much stronger one are dropped. With `min_neighbors == 0` the input is
/// returned untouched.
pub fn group_rectangles(rects: &[FaceBox], min_neighbors: usize, eps: f64) -> Vec<FaceBox> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects.to_vec();
    }

    let mut parent: Vec<usize> = (0..rects.len()).collect();
    for i in 0..rects.len() {
        for j in (i + 1)..rects.len() {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    // label -> (sum x, sum y, sum w, sum h, count)
    let mut sums: std::collections::BTreeMap<usize, [u64; 5]> = std::collections::BTreeMap::new();
    for (i, r) in rects.iter().enumerate() {
        let label = find(&mut parent, i);
        let acc = sums.entry(label).or_insert([0; 5]);
        acc[0] += r.x as u64;
        acc[1] += r.y as u64;
        acc[2] += r.width as u64;
        acc[3] += r.height as u64;
        acc[4] += 1;
    }

    let clusters: Vec<(FaceBox, u64)> = sums
        .values()
        .filter(|acc| acc[4] as usize > min_neighbors)
        .map(|acc| {
            let n = acc[4];
            let avg = |v: u64| ((v as f64) / n as f64).round() as u32;
            (FaceBox::new(avg(acc[0]), avg(acc[1]), avg(acc[2]), avg(acc[3])), n)
        })
        .collect();

    clusters
        .iter()
        .filter(|(inner, inner_n)| {
            !clusters.iter().any(|(outer, outer_n)| {
                outer != inner && outer.contains_box(inner) && (*outer_n > (*inner_n).max(3) || *inner_n < 3)
            })
        })
        .map(|(r, _)| *r)
        .collect()
}

fn similar(a: &FaceBox, b: &FaceBox, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}
