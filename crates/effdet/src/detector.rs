use {
    crate::{
        anchors::Anchors,
        error::EffDetError,
        model::{EfficientDetNet, NetOutputs},
        postprocess::{Detections, PostMode, postprocess},
        preprocess::{PreMode, frame_to_tensor, preprocess_batch},
    },
    base::Frame,
    candle_core::{Device, Tensor},
    futures_core::Stream,
    futures_sink::Sink,
    std::{
        collections::VecDeque,
        fmt,
        future::Future,
        pin::Pin,
        sync::Arc,
        task::{Context, Poll, Waker},
    },
};

#[derive(Debug, Clone)]
pub struct ModelOutputs {
    pub net: NetOutputs,
    /// One entry per image when detection postprocessing ran.
    pub detections: Option<Vec<Detections>>,
}

/// EfficientDet with optional input preprocessing and detection postprocessing.
#[derive(Debug)]
pub struct EfficientDetModel {
    net: EfficientDetNet,
    anchors: Anchors,
}

impl EfficientDetModel {
    pub fn new(net: EfficientDetNet) -> Result<Self, EffDetError> {
        let anchors = Anchors::from_config(net.config())?;
        Ok(Self { net, anchors })
    }

    pub fn net(&self) -> &EfficientDetNet {
        &self.net
    }

    /// Runs preprocessing, the network and postprocessing.
    ///
    /// With `PreMode::Infer`, `images` holds raw `[b, h, w, 3]` pixels; with
    /// `PreMode::None` it is the `[b, 3, H, W]` network input and boxes stay
    /// in network pixels.
    pub fn forward(
        &self,
        images: &Tensor,
        train: bool,
        pre_mode: PreMode,
        post_mode: PostMode,
    ) -> Result<ModelOutputs, EffDetError> {
        let (inputs, scales) = match pre_mode {
            PreMode::None => (images.clone(), vec![1.0; images.dim(0)?]),
            PreMode::Infer => preprocess_batch(images, self.net.config())?,
        };
        let net = self.net.forward(&inputs, train)?;

        let detections = match (&net.detection, post_mode) {
            (Some(outputs), PostMode::Global | PostMode::PerClass) => {
                let (_b, _c, h, w) = inputs.dims4()?;
                let level_hw = outputs
                    .class_outputs
                    .iter()
                    .map(|xs| {
                        let (_b, _c, fh, fw) = xs.dims4()?;
                        Ok((fh, fw))
                    })
                    .collect::<Result<Vec<_>, EffDetError>>()?;
                let rebuilt;
                let anchors = if self.anchors.matches((h, w), &level_hw) {
                    &self.anchors
                } else {
                    log::debug!("rebuilding anchors for input {h}x{w}");
                    rebuilt = Anchors::new(self.net.config(), (h, w), &level_hw)?;
                    &rebuilt
                };
                let config = self.net.config();
                Some(postprocess(
                    &outputs.class_outputs,
                    &outputs.box_outputs,
                    anchors,
                    config.num_classes,
                    &scales,
                    post_mode,
                    &config.postprocess,
                )?)
            }
            _ => None,
        };

        Ok(ModelOutputs { net, detections })
    }

    /// Detections for a single frame, in frame pixels.
    pub fn detect(&self, frame: &Frame, device: &Device, post_mode: PostMode) -> Result<Detections, EffDetError> {
        let image = frame_to_tensor(frame, device)?;
        let outputs = self.forward(&image, false, PreMode::Infer, post_mode)?;
        Ok(outputs.detections.and_then(|mut d| d.pop()).unwrap_or_default())
    }
}

/// Runs EfficientDet on a stream of frames.
///
/// Implements `Sink<Frame>` for input and `Stream<Item = Result<Detections>>`
/// for output, one result per frame in order. Closing the sink ends the
/// stream once every pending frame has been processed.
pub struct Detector {
    model: Arc<EfficientDetModel>,
    device: Device,
    post_mode: PostMode,
    pending: VecDeque<Frame>,
    closed: bool,
    inflight: Option<Pin<Box<dyn Future<Output = Result<Detections, EffDetError>> + Send>>>,
    stream_waker: Option<Waker>,
}

impl fmt::Debug for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detector")
            .field("device", &self.device)
            .field("post_mode", &self.post_mode)
            .field("pending", &self.pending.len())
            .field("closed", &self.closed)
            .field("inflight", &self.inflight.is_some())
            .finish()
    }
}

impl Detector {
    pub fn new(model: EfficientDetModel, device: Device) -> Self {
        Self {
            model: Arc::new(model),
            device,
            post_mode: PostMode::Global,
            pending: VecDeque::new(),
            closed: false,
            inflight: None,
            stream_waker: None,
        }
    }

    pub fn with_post_mode(mut self, post_mode: PostMode) -> Self {
        self.post_mode = post_mode;
        self
    }

    pub fn model(&self) -> &EfficientDetModel {
        &self.model
    }

    fn start_detection(&mut self, frame: Frame) {
        let model = Arc::clone(&self.model);
        let device = self.device.clone();
        let post_mode = self.post_mode;

        self.inflight = Some(Box::pin(async move {
            tokio::task::spawn_blocking(move || model.detect(&frame, &device, post_mode))
                .await
                .map_err(|e| EffDetError::Runtime(format!("detection task failed: {e}")))?
        }));
    }

    fn poll_inflight(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Detections, EffDetError>>> {
        let Some(fut) = self.inflight.as_mut() else {
            return Poll::Ready(None);
        };
        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                self.inflight = None;
                Poll::Ready(Some(result))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Sink<Frame> for Detector {
    type Error = EffDetError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), EffDetError>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<(), EffDetError> {
        let this = self.get_mut();
        if this.closed {
            return Err(EffDetError::Runtime("detector sink is closed".to_string()));
        }
        this.pending.push_back(item);
        if let Some(waker) = this.stream_waker.take() {
            waker.wake();
        }
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), EffDetError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), EffDetError>> {
        let this = self.get_mut();
        this.closed = true;
        if let Some(waker) = this.stream_waker.take() {
            waker.wake();
        }
        Poll::Ready(Ok(()))
    }
}

impl Stream for Detector {
    type Item = Result<Detections, EffDetError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.inflight.is_some() {
            return this.poll_inflight(cx);
        }
        if let Some(frame) = this.pending.pop_front() {
            this.start_detection(frame);
            return this.poll_inflight(cx);
        }
        if this.closed {
            return Poll::Ready(None);
        }

        this.stream_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

fn _assert_send() {
    fn assert<T: Send>() {}
    assert::<Detector>();
}
