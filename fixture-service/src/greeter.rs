use crate::pb::helloworld::{HelloReply, HelloRequest, greeter_server::Greeter};
use tonic::{Request, Response, Status};

pub struct GreeterService;

#[tonic::async_trait]
impl Greeter for GreeterService {
    async fn say_hello(
        &self,
        request: Request<HelloRequest>,
    ) -> Result<Response<HelloReply>, Status> {
        // Echo every `x-` header back so metadata propagation can be asserted.
        let echoed: Vec<_> = request
            .metadata()
            .iter()
            .filter_map(|entry| match entry {
                tonic::metadata::KeyAndValueRef::Ascii(key, value)
                    if key.as_str().starts_with("x-") =>
                {
                    Some((key.clone(), value.clone()))
                }
                _ => None,
            })
            .collect();

        let name = request.into_inner().name;
        let mut response = Response::new(HelloReply {
            message: format!("Hello {}", name),
        });

        for (key, value) in echoed {
            response.metadata_mut().append(key, value);
        }

        Ok(response)
    }
}
