use image::{GrayImage, RgbImage};
use imageproc::contours::find_contours;
use imageproc::edges::canny;
use imageproc::filter::box_filter;
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use imageproc::geometry::{approximate_polygon_dp, arc_length};
use imageproc::point::Point as ContourPoint;

use crate::context::Scanarium;
use crate::error::{ErrorKind, Result, ScanariumError};
use crate::geometry::{Point, Quad, Rect};
use crate::scan::prepare::{contrasts, prepare_image};

/// Contours smaller than 1/25 of the frame cannot be the sheet.
const MIN_AREA_FRACTION: f64 = 1.0 / 25.0;

/// Inset factor for the four required points derived from the QR rect:
/// 0.25 reaches the symbol under a 45-degree rotation, plus 0.05 wiggle.
const QR_INSET_FACTOR: f32 = 0.30;

fn error_no_approx() -> ScanariumError {
    ScanariumError::new(
        ErrorKind::NoApprox,
        "Failed to find black bounding rectangle in image",
    )
}

fn shoelace_area(points: &[Point]) -> f64 {
    let mut doubled = 0.0f64;
    for (i, a) in points.iter().enumerate() {
        let b = &points[(i + 1) % points.len()];
        doubled += a.x as f64 * b.y as f64 - b.x as f64 * a.y as f64;
    }
    doubled.abs() / 2.0
}

fn contour_area(points: &[ContourPoint<i32>]) -> f64 {
    let mut doubled = 0.0f64;
    for (i, a) in points.iter().enumerate() {
        let b = &points[(i + 1) % points.len()];
        doubled += a.x as f64 * b.y as f64 - b.x as f64 * a.y as f64;
    }
    doubled.abs() / 2.0
}

/// Ray-casting point-in-polygon test; points on an edge count as inside
/// for the purpose of the required-point check.
fn point_in_polygon(polygon: &[Point], point: &Point) -> bool {
    let mut inside = false;
    for (i, a) in polygon.iter().enumerate() {
        let b = &polygon[(i + 1) % polygon.len()];
        if (a.y > point.y) != (b.y > point.y) {
            let intersect_x = a.x + (point.y - a.y) / (b.y - a.y) * (b.x - a.x);
            if point.x < intersect_x {
                inside = !inside;
            } else if (point.x - intersect_x).abs() < 1.0 {
                return true;
            }
        }
    }
    inside
}

/// Find a 4-gon in an edge-detected frame. Contours are tried by area,
/// biggest first by default; smallest first when the caller wants the
/// tightest rectangle that still encloses the required points.
fn find_rect_points(
    scanarium: &Scanarium,
    prepared: &GrayImage,
    decreasing_area: bool,
    required_points: &[Point],
) -> Result<Option<Vec<Point>>> {
    let config = scanarium.config();
    let image_area = prepared.width() as f64 * prepared.height() as f64;
    let contour_min_area = image_area * MIN_AREA_FRACTION;

    let blur_size = config.int("scan", "canny_blur_size")?;
    let threshold_1 = config.int("scan", "canny_threshold_1")? as f32;
    let threshold_2 = config.int("scan", "canny_threshold_2")? as f32;

    let blurred;
    let edges_input = if blur_size > 1 {
        let radius = (blur_size / 2) as u32;
        blurred = box_filter(prepared, radius, radius);
        &blurred
    } else {
        prepared
    };
    let edges = canny(edges_input, threshold_1, threshold_2);

    let mut contours: Vec<Vec<ContourPoint<i32>>> = find_contours::<i32>(&edges)
        .into_iter()
        .map(|contour| contour.points)
        .collect();
    contours.sort_by(|a, b| {
        let ordering = contour_area(a).total_cmp(&contour_area(b));
        if decreasing_area {
            ordering.reverse()
        } else {
            ordering
        }
    });

    for contour in &contours {
        if contour_area(contour) < contour_min_area {
            continue;
        }
        let perimeter = arc_length(contour, true);
        let approx = approximate_polygon_dp(contour, 0.02 * perimeter, true);
        if approx.len() != 4 {
            continue;
        }
        let approx: Vec<Point> = approx
            .iter()
            .map(|point| Point::new(point.x as f32, point.y as f32))
            .collect();
        if required_points
            .iter()
            .any(|point| !point_in_polygon(&approx, point))
        {
            continue;
        }
        return Ok(Some(approx));
    }
    Ok(None)
}

/// Sort a found 4-gon into (top-left, top-right, bottom-right,
/// bottom-left). Heuristic (a) expects a roughly axis-aligned sheet;
/// heuristic (b) covers sheets rotated towards 45 degrees, where the
/// coordinate sums degenerate. A heuristic is only accepted when the
/// chosen corners are pairwise at least 10% of the frame's smaller
/// dimension apart.
fn sort_quad(points: &[Point], image_width: u32, image_height: u32) -> Result<Quad> {
    let min_distance = image_width.min(image_height) as f32 * 0.1;

    let acceptable = |quad: &Quad| {
        for i in 0..4 {
            for j in (i + 1)..4 {
                if quad[i].distance(&quad[j]) <= min_distance {
                    return false;
                }
            }
        }
        true
    };

    let extreme = |key: fn(&Point) -> f32, max: bool| -> Point {
        let mut best = points[0];
        for point in &points[1..] {
            let better = if max {
                key(point) > key(&best)
            } else {
                key(point) < key(&best)
            };
            if better {
                best = *point;
            }
        }
        best
    };

    // Heuristic (a): corner sums/differences.
    let quad: Quad = [
        extreme(|p| p.x + p.y, false),
        extreme(|p| p.x - p.y, true),
        extreme(|p| p.x + p.y, true),
        extreme(|p| p.x - p.y, false),
    ];
    if acceptable(&quad) {
        return Ok(quad);
    }

    // Heuristic (b): by-y ordering for a ~45 degree rotation.
    let mut by_y: Vec<Point> = points.to_vec();
    by_y.sort_by(|a, b| a.y.total_cmp(&b.y));
    if by_y.len() == 4 {
        let (bottom_left, top_right) = if by_y[1].x < by_y[2].x {
            (by_y[1], by_y[2])
        } else {
            (by_y[2], by_y[1])
        };
        let quad: Quad = [by_y[0], top_right, by_y[3], bottom_left];
        if acceptable(&quad) {
            return Ok(quad);
        }
    }

    Err(error_no_approx())
}

fn sample_grey_bilinear(image: &GrayImage, x: f32, y: f32) -> f32 {
    let (width, height) = image.dimensions();
    let x = x.clamp(0.0, (width - 1) as f32);
    let y = y.clamp(0.0, (height - 1) as f32);
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let tx = x - x0 as f32;
    let ty = y - y0 as f32;
    let p00 = image.get_pixel(x0, y0).0[0] as f32;
    let p10 = image.get_pixel(x1, y0).0[0] as f32;
    let p01 = image.get_pixel(x0, y1).0[0] as f32;
    let p11 = image.get_pixel(x1, y1).0[0] as f32;
    let top = p00 + (p10 - p00) * tx;
    let bottom = p01 + (p11 - p01) * tx;
    top + (bottom - top) * ty
}

/// Iterative sub-pixel corner refinement: inside the search window the
/// image gradient at every sample is orthogonal to the vector towards the
/// true corner, which yields 2x2 normal equations per iteration.
fn refine_corner(
    image: &GrayImage,
    start: Point,
    window: i32,
    iteration_bound: i64,
    accuracy: f64,
) -> Point {
    let mut current = start;
    for _ in 0..iteration_bound {
        let mut a = 0.0f64;
        let mut b = 0.0f64;
        let mut c = 0.0f64;
        let mut bx = 0.0f64;
        let mut by = 0.0f64;
        for j in -window..=window {
            for i in -window..=window {
                let px = current.x + i as f32;
                let py = current.y + j as f32;
                let gx = (sample_grey_bilinear(image, px + 1.0, py)
                    - sample_grey_bilinear(image, px - 1.0, py)) as f64
                    / 2.0;
                let gy = (sample_grey_bilinear(image, px, py + 1.0)
                    - sample_grey_bilinear(image, px, py - 1.0)) as f64
                    / 2.0;
                let weight = (-((i * i + j * j) as f64)
                    / (2.0 * (window as f64 / 2.0).powi(2).max(1.0)))
                .exp();
                a += weight * gx * gx;
                b += weight * gx * gy;
                c += weight * gy * gy;
                bx += weight * (gx * gx * px as f64 + gx * gy * py as f64);
                by += weight * (gx * gy * px as f64 + gy * gy * py as f64);
            }
        }
        let det = a * c - b * b;
        if det.abs() < 1e-9 {
            break;
        }
        let next = Point::new(
            ((c * bx - b * by) / det) as f32,
            ((a * by - b * bx) / det) as f32,
        );
        let shift = next.distance(&current) as f64;
        current = next;
        if shift < accuracy {
            break;
        }
    }
    current
}

/// Refine all four corners against the full-resolution greyscale frame.
fn refine_corners(scanarium: &Scanarium, grey: &GrayImage, points: Vec<Point>) -> Result<Vec<Point>> {
    let config = scanarium.config();
    let window_size = config.int("scan", "corner_refinement_size")?;
    if window_size <= 1 {
        return Ok(points);
    }
    let iteration_bound = config.int("scan", "corner_refinement_iteration_bound")?;
    let accuracy = config.float("scan", "corner_refinement_accuracy")?;
    Ok(points
        .into_iter()
        .map(|point| {
            refine_corner(
                grey,
                point,
                window_size as i32,
                iteration_bound,
                accuracy,
            )
        })
        .collect())
}

/// Warp the source frame so the sorted quad becomes an upright rectangle.
fn rectify_by_rect_points(image: &RgbImage, quad: &Quad) -> Result<RgbImage> {
    let [tl, tr, br, bl] = quad;
    let dest_width = br.distance(bl).max(tr.distance(tl)) as i64 - 1;
    let dest_height = tr.distance(br).max(tl.distance(bl)) as i64 - 1;
    if dest_width < 1 || dest_height < 1 {
        return Err(error_no_approx());
    }
    let (dest_width, dest_height) = (dest_width as u32, dest_height as u32);

    let projection = Projection::from_control_points(
        [(tl.x, tl.y), (tr.x, tr.y), (br.x, br.y), (bl.x, bl.y)],
        [
            (0.0, 0.0),
            (dest_width as f32, 0.0),
            (dest_width as f32, dest_height as f32),
            (0.0, dest_height as f32),
        ],
    )
    .ok_or_else(error_no_approx)?;

    let mut rectified = RgbImage::new(dest_width, dest_height);
    warp_into(
        image,
        &projection,
        Interpolation::Bilinear,
        image::Rgb([0, 0, 0]),
        &mut rectified,
    );
    Ok(rectified)
}

/// Find the sheet quad: per contrast the first accepted candidate is
/// collected, the smallest-area candidate across all contrasts wins, and
/// the corners are refined after un-scaling against the original frame.
pub fn find_sheet_quad(
    scanarium: &Scanarium,
    image: &RgbImage,
    decreasing_area: bool,
    required_points: &[Point],
) -> Result<Quad> {
    let mut candidates: Vec<(Vec<Point>, f32)> = Vec::new();
    for contrast in contrasts(scanarium)? {
        let (prepared, scale_factor) = prepare_image(scanarium, image, contrast)?;
        let scaled_required: Vec<Point> = required_points
            .iter()
            .map(|point| {
                Point::new(
                    (point.x * scale_factor).floor(),
                    (point.y * scale_factor).floor(),
                )
            })
            .collect();
        if let Some(points) =
            find_rect_points(scanarium, &prepared, decreasing_area, &scaled_required)?
        {
            candidates.push((points, scale_factor));
        }
    }

    let (points, scale_factor) = candidates
        .into_iter()
        .min_by(|(a, a_scale), (b, b_scale)| {
            // Compare in source coordinates so contrasts with different
            // preparation scales stay comparable.
            let a_area = shoelace_area(a) / (*a_scale as f64 * *a_scale as f64);
            let b_area = shoelace_area(b) / (*b_scale as f64 * *b_scale as f64);
            a_area.total_cmp(&b_area)
        })
        .ok_or_else(error_no_approx)?;

    let unscaled: Vec<Point> = points
        .iter()
        .map(|point| Point::new(point.x / scale_factor, point.y / scale_factor))
        .collect();
    let grey = image::imageops::grayscale(image);
    let refined = refine_corners(scanarium, &grey, unscaled)?;
    sort_quad(&refined, image.width(), image.height())
}

/// Rectify to the biggest 4-gon found in the frame.
pub fn rectify_to_biggest_rect(scanarium: &Scanarium, image: &RgbImage) -> Result<RgbImage> {
    let quad = find_sheet_quad(scanarium, image, true, &[])?;
    rectify_by_rect_points(image, &quad)
}

/// The four insets of a QR bounding rect that the sheet contour must
/// enclose.
pub fn qr_parent_required_points(qr_rect: &Rect) -> [Point; 4] {
    let at = |x_factor: f32, y_factor: f32| {
        Point::new(
            qr_rect.left + x_factor * qr_rect.width,
            qr_rect.top + y_factor * qr_rect.height,
        )
    };
    [
        at(QR_INSET_FACTOR, QR_INSET_FACTOR),
        at(1.0 - QR_INSET_FACTOR, QR_INSET_FACTOR),
        at(QR_INSET_FACTOR, 1.0 - QR_INSET_FACTOR),
        at(1.0 - QR_INSET_FACTOR, 1.0 - QR_INSET_FACTOR),
    ]
}

/// Rectify to the smallest 4-gon still enclosing the QR code: the sheet
/// border rather than, say, the table edge around it.
pub fn rectify_to_qr_parent_rect(
    scanarium: &Scanarium,
    image: &RgbImage,
    qr_rect: &Rect,
) -> Result<RgbImage> {
    let required_points = qr_parent_required_points(qr_rect);
    let quad = find_sheet_quad(scanarium, image, false, &required_points)?;
    rectify_by_rect_points(image, &quad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn scanarium() -> Scanarium {
        let config = Config::parse(
            r#"{
                "scan": {
                    "contrasts": "1",
                    "canny_blur_size": 1,
                    "canny_threshold_1": 30,
                    "canny_threshold_2": 150,
                    "corner_refinement_size": 1,
                    "corner_refinement_iteration_bound": 100,
                    "corner_refinement_accuracy": 0.05
                }
            }"#,
        )
        .unwrap();
        Scanarium::new(config)
    }

    #[test]
    fn sorts_axis_aligned_quad() {
        let points = [
            Point::new(280.0, 20.0),
            Point::new(30.0, 210.0),
            Point::new(25.0, 15.0),
            Point::new(290.0, 220.0),
        ];
        let quad = sort_quad(&points, 320, 240).unwrap();
        assert_eq!(quad[0], Point::new(25.0, 15.0));
        assert_eq!(quad[1], Point::new(280.0, 20.0));
        assert_eq!(quad[2], Point::new(290.0, 220.0));
        assert_eq!(quad[3], Point::new(30.0, 210.0));
    }

    #[test]
    fn sorted_quad_extremes_hold() {
        // Invariant: after heuristic (a), TL has the smallest x+y and BR
        // the largest.
        let points = [
            Point::new(60.0, 40.0),
            Point::new(250.0, 50.0),
            Point::new(240.0, 200.0),
            Point::new(50.0, 190.0),
        ];
        let quad = sort_quad(&points, 300, 240).unwrap();
        for point in &points {
            assert!(quad[0].x + quad[0].y <= point.x + point.y);
            assert!(quad[2].x + quad[2].y >= point.x + point.y);
        }
    }

    #[test]
    fn sorts_diamond_quad_via_second_heuristic() {
        // Rotated ~45 degrees: the sum/difference heuristic degenerates.
        let points = [
            Point::new(50.0, 10.0),
            Point::new(90.0, 50.0),
            Point::new(50.0, 90.0),
            Point::new(10.0, 50.0),
        ];
        let quad = sort_quad(&points, 100, 100).unwrap();
        assert_eq!(quad[0], Point::new(50.0, 10.0));
        assert_eq!(quad[1], Point::new(90.0, 50.0));
        assert_eq!(quad[2], Point::new(50.0, 90.0));
        assert_eq!(quad[3], Point::new(10.0, 50.0));
    }

    #[test]
    fn degenerate_quad_is_rejected() {
        let points = [
            Point::new(10.0, 10.0),
            Point::new(11.0, 10.0),
            Point::new(200.0, 150.0),
            Point::new(10.0, 150.0),
        ];
        let error = sort_quad(&points, 300, 200).unwrap_err();
        assert_eq!(error.kind, ErrorKind::NoApprox);
    }

    #[test]
    fn point_in_polygon_basics() {
        let square = [
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(0.0, 10.0),
        ];
        assert!(point_in_polygon(&square, &Point::new(5.0, 5.0)));
        assert!(!point_in_polygon(&square, &Point::new(15.0, 5.0)));
        assert!(!point_in_polygon(&square, &Point::new(-3.0, 5.0)));
    }

    #[test]
    fn qr_parent_insets_lie_inside_the_rect() {
        let rect = Rect::new(100.0, 200.0, 50.0, 50.0);
        for point in qr_parent_required_points(&rect) {
            assert!(point.x > rect.left && point.x < rect.left + rect.width);
            assert!(point.y > rect.top && point.y < rect.top + rect.height);
        }
    }

    fn frame_with_rect(left: u32, top: u32, right: u32, bottom: u32) -> RgbImage {
        let mut canvas = RgbImage::from_pixel(400, 300, image::Rgb([255, 255, 255]));
        for x in left..=right {
            for t in 0..3 {
                canvas.put_pixel(x, top + t, image::Rgb([0, 0, 0]));
                canvas.put_pixel(x, bottom - t, image::Rgb([0, 0, 0]));
            }
        }
        for y in top..=bottom {
            for t in 0..3 {
                canvas.put_pixel(left + t, y, image::Rgb([0, 0, 0]));
                canvas.put_pixel(right - t, y, image::Rgb([0, 0, 0]));
            }
        }
        canvas
    }

    #[test]
    fn rectifies_drawn_rectangle() {
        let canvas = frame_with_rect(50, 40, 350, 260);
        let rectified = rectify_to_biggest_rect(&scanarium(), &canvas).unwrap();
        let (width, height) = rectified.dimensions();
        assert!((295..=305).contains(&width), "width {width}");
        assert!((215..=225).contains(&height), "height {height}");
    }

    #[test]
    fn no_rectangle_is_no_approx() {
        let canvas = RgbImage::from_pixel(300, 200, image::Rgb([255, 255, 255]));
        let error = rectify_to_biggest_rect(&scanarium(), &canvas).unwrap_err();
        assert_eq!(error.kind, ErrorKind::NoApprox);
    }

    #[test]
    fn required_point_outside_rejects_candidate() {
        let canvas = frame_with_rect(50, 40, 350, 260);
        // A QR rect far outside the drawn rectangle: nothing encloses it.
        let qr_rect = Rect::new(360.0, 270.0, 30.0, 30.0);
        let error = rectify_to_qr_parent_rect(&scanarium(), &canvas, &qr_rect).unwrap_err();
        assert_eq!(error.kind, ErrorKind::NoApprox);
    }

    #[test]
    fn corner_refinement_converges_to_corner() {
        // Black quadrant with its corner at (50.0, 50.0).
        let mut image = GrayImage::from_pixel(100, 100, image::Luma([255]));
        for y in 50..100 {
            for x in 50..100 {
                image.put_pixel(x, y, image::Luma([0]));
            }
        }
        let refined = refine_corner(&image, Point::new(48.0, 53.0), 5, 100, 0.01);
        assert!(refined.distance(&Point::new(50.0, 50.0)) < 2.0);
    }
}
