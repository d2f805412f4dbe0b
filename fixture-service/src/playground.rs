use crate::pb::playground::{
    ChatMessage, FailRequest, Lease, Number, Sample, SleepRequest, Sum, Tick, TickRequest,
    TreeNode, playground_server::Playground,
};
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt, wrappers::ReceiverStream};
use tonic::{Code, Request, Response, Status, Streaming};

pub struct PlaygroundService;

#[tonic::async_trait]
impl Playground for PlaygroundService {
    type TicksStream = ReceiverStream<Result<Tick, Status>>;
    type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatMessage, Status>> + Send>>;

    async fn echo(&self, request: Request<Sample>) -> Result<Response<Sample>, Status> {
        Ok(Response::new(request.into_inner()))
    }

    async fn mirror(&self, request: Request<TreeNode>) -> Result<Response<TreeNode>, Status> {
        fn flip(node: TreeNode) -> TreeNode {
            TreeNode {
                value: node.value,
                left: node.right.map(|n| Box::new(flip(*n))),
                right: node.left.map(|n| Box::new(flip(*n))),
            }
        }

        Ok(Response::new(flip(request.into_inner())))
    }

    async fn renew(&self, request: Request<Lease>) -> Result<Response<Lease>, Status> {
        Ok(Response::new(request.into_inner()))
    }

    async fn count(&self, request: Request<Streaming<Number>>) -> Result<Response<Sum>, Status> {
        let mut stream = request.into_inner();
        let mut sum = Sum { total: 0, count: 0 };

        while let Some(number) = stream.next().await {
            sum.total += number?.n;
            sum.count += 1;
        }

        Ok(Response::new(sum))
    }

    async fn ticks(
        &self,
        request: Request<TickRequest>,
    ) -> Result<Response<Self::TicksStream>, Status> {
        let TickRequest { count, hold } = request.into_inner();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            for seq in 0..count {
                if tx.send(Ok(Tick { seq })).await.is_err() {
                    return;
                }
            }

            if hold {
                tx.closed().await;
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn chat(
        &self,
        request: Request<Streaming<ChatMessage>>,
    ) -> Result<Response<Self::ChatStream>, Status> {
        let mut in_stream = request.into_inner();
        let (tx, rx) = mpsc::channel(128);

        tokio::spawn(async move {
            while let Some(result) = in_stream.next().await {
                match result {
                    Ok(msg) => {
                        let reply = ChatMessage {
                            text: format!("echo: {}", msg.text),
                        };
                        if tx.send(Ok(reply)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn fail(&self, request: Request<FailRequest>) -> Result<Response<()>, Status> {
        let FailRequest { code, message } = request.into_inner();
        Err(Status::new(Code::from(code), message))
    }

    async fn sleep(&self, request: Request<SleepRequest>) -> Result<Response<()>, Status> {
        let millis = request.into_inner().millis;
        tokio::time::sleep(Duration::from_millis(u64::from(millis))).await;
        Ok(Response::new(()))
    }
}
