use base::{Frame, FrameError};

#[test]
fn test_frame_new_validates_length() {
    assert!(Frame::new(2, 2, vec![0; 12]).is_ok());
    assert_eq!(
        Frame::new(2, 2, vec![0; 11]).unwrap_err(),
        FrameError::SizeMismatch { expected: 12, got: 11 }
    );
}

#[test]
fn test_frame_rejects_zero_dimensions() {
    let err = Frame::new(0, 4, vec![]).unwrap_err();
    assert!(err.to_string().contains("non-zero"));
}

#[test]
fn test_frame_pixel_lookup() {
    let data = (0u8..18).collect();
    let frame = Frame::new(3, 2, data).unwrap();
    assert_eq!(frame.pixel(0, 0), Some([0, 1, 2]));
    assert_eq!(frame.pixel(2, 1), Some([15, 16, 17]));
    assert_eq!(frame.pixel(3, 0), None);
}

#[test]
fn test_frame_filled() {
    let frame = Frame::filled(4, 3, [10, 20, 30]).unwrap();
    assert_eq!(frame.data().len(), 36);
    assert_eq!(frame.pixel(3, 2), Some([10, 20, 30]));
}
